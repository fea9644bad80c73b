use num_bigint::BigUint;
use rand::RngCore;

/// Size in bytes of a Diffie-Hellman public key and shared secret
pub const DH_KEY_SIZE: usize = 128;

// 1024 bit MODP prime from RFC 2409 (second Oakley group), generator 2.  This is the group
// every RTMFP endpoint uses, so both sides of a handshake agree on it implicitly.
const DH_PRIME: [u8; DH_KEY_SIZE] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2, 0x21, 0x68, 0xC2,
    0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1, 0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67,
    0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6, 0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E,
    0x34, 0x04, 0xDD, 0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45, 0xE4, 0x85, 0xB5,
    0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9, 0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF,
    0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED, 0xEE, 0x38, 0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, 0xAE,
    0x9F, 0x24, 0x11, 0x7C, 0x4B, 0x1F, 0xE6, 0x49, 0x28, 0x66, 0x51, 0xEC, 0xE6, 0x53, 0x81,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// One side of a classic Diffie-Hellman exchange over the RTMFP group.
///
/// The private exponent is drawn once at construction; the same key pair serves every
/// handshake an engine performs.
pub struct DiffieHellman {
    private: BigUint,
    public: Vec<u8>,
}

impl DiffieHellman {
    pub fn new() -> DiffieHellman {
        let mut secret = [0_u8; DH_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut secret);

        let prime = BigUint::from_bytes_be(&DH_PRIME);
        let private = BigUint::from_bytes_be(&secret) % &prime;
        let public = BigUint::from(2_u8).modpow(&private, &prime);

        DiffieHellman {
            private,
            public: to_fixed_width(public),
        }
    }

    /// Our 128 byte public key, as written into handshake packets
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Computes the 128 byte shared secret from the peer's public key
    pub fn shared_secret(&self, far_public_key: &[u8]) -> Vec<u8> {
        let prime = BigUint::from_bytes_be(&DH_PRIME);
        let far_public = BigUint::from_bytes_be(far_public_key);
        to_fixed_width(far_public.modpow(&self.private, &prime))
    }
}

fn to_fixed_width(value: BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut fixed = vec![0_u8; DH_KEY_SIZE.saturating_sub(bytes.len())];
    fixed.extend_from_slice(&bytes);
    fixed
}
