use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::packet_io::KEY_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// Size of a handshake tag
pub const TAG_SIZE: usize = 16;

/// Size of a responder cookie
pub const COOKIE_SIZE: usize = 64;

/// Size of a session nonce
pub const NONCE_SIZE: usize = 32;

/// Size of a peer id (a SHA-256 digest)
pub const PEER_ID_SIZE: usize = 32;

const CERTIFICATE_PREFIX: [u8; 4] = [0x01, 0x0A, 0x41, 0x0E];
const CERTIFICATE_RANDOM_SIZE: usize = 64;

pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Derives the two directional AES keys of a session from the shared secret and the nonces
/// both sides exchanged.  The initiator encrypts outbound traffic with the request key and
/// decrypts with the response key; the responder swaps them.
pub fn compute_asymmetric_keys(
    shared_secret: &[u8],
    initiator_nonce: &[u8],
    responder_nonce: &[u8],
) -> ([u8; KEY_SIZE], [u8; KEY_SIZE]) {
    let request_digest = hmac_sha256(
        shared_secret,
        &hmac_sha256(responder_nonce, initiator_nonce),
    );
    let response_digest = hmac_sha256(
        shared_secret,
        &hmac_sha256(initiator_nonce, responder_nonce),
    );

    let mut request_key = [0_u8; KEY_SIZE];
    let mut response_key = [0_u8; KEY_SIZE];
    request_key.copy_from_slice(&request_digest[..KEY_SIZE]);
    response_key.copy_from_slice(&response_digest[..KEY_SIZE]);

    (request_key, response_key)
}

/// Generates the certificate bytes a client presents in its second handshake round.  The
/// peer id is the SHA-256 of exactly these bytes, so they stay fixed for an engine's life.
pub fn generate_certificate() -> Vec<u8> {
    let mut certificate = Vec::with_capacity(CERTIFICATE_PREFIX.len() + CERTIFICATE_RANDOM_SIZE);
    certificate.extend_from_slice(&CERTIFICATE_PREFIX);

    let mut random = [0_u8; CERTIFICATE_RANDOM_SIZE];
    rand::thread_rng().fill_bytes(&mut random);
    certificate.extend_from_slice(&random);

    certificate
}

pub fn peer_id_from_certificate(certificate: &[u8]) -> [u8; PEER_ID_SIZE] {
    let digest = Sha256::digest(certificate);
    digest.into()
}

/// Lower case hex rendering of a peer id, the format used in logs and the group layer
pub fn peer_id_to_hex(peer_id: &[u8]) -> String {
    let mut hex = String::with_capacity(peer_id.len() * 2);
    for byte in peer_id {
        hex.push_str(&format!("{:02x}", byte));
    }

    hex
}

/// Parses a 64 character hex string back into peer id bytes
pub fn peer_id_from_hex(hex: &str) -> Option<[u8; PEER_ID_SIZE]> {
    if hex.len() != PEER_ID_SIZE * 2 {
        return None;
    }

    let mut peer_id = [0_u8; PEER_ID_SIZE];
    for (index, byte) in peer_id.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[index * 2..index * 2 + 2], 16).ok()?;
    }

    Some(peer_id)
}

pub fn generate_tag() -> [u8; TAG_SIZE] {
    let mut tag = [0_u8; TAG_SIZE];
    rand::thread_rng().fill_bytes(&mut tag);
    tag
}

pub fn generate_cookie() -> Vec<u8> {
    let mut cookie = vec![0_u8; COOKIE_SIZE];
    rand::thread_rng().fill_bytes(&mut cookie);
    cookie
}

pub fn generate_nonce() -> Vec<u8> {
    let mut nonce = vec![0_u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}
