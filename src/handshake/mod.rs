//! The RTMFP handshake layer.
//!
//! A handshake is two round trips: the initiator announces an endpoint discriminator and a
//! routing tag, the responder answers with a cookie, and the second round performs a
//! Diffie-Hellman agreement bound to that cookie.  The [`Handshaker`] drives every attempt an
//! engine has in flight, answers far peers wanting to reach us, and hands fully keyed
//! sessions to the caller once the fourth packet lands.
//!
//! All handshake datagrams are encrypted with the well known default key and carry the 0x0B
//! marker; the caller decodes them before handing the chunk bytes in here.

mod dh;
mod errors;
mod keying;
mod packets;

pub use self::dh::{DiffieHellman, DH_KEY_SIZE};
pub use self::errors::HandshakeError;
pub use self::keying::{
    compute_asymmetric_keys, hmac_sha256, peer_id_from_certificate, peer_id_from_hex,
    peer_id_to_hex, COOKIE_SIZE, NONCE_SIZE, PEER_ID_SIZE, TAG_SIZE,
};
pub use self::packets::{
    Epd, Handshake30, Handshake38, Handshake70, Handshake78, Redirection, HANDSHAKE_30,
    HANDSHAKE_38, HANDSHAKE_70, HANDSHAKE_78, HANDSHAKE_REDIRECTION,
};

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::messages::{read_address, AddressType, ChunkReader, MessageSerializationError};
use crate::packet_io::{encode, init_packet, RtmfpCipher, KEY_SIZE, MARKER_HANDSHAKE};
use crate::time::RtmfpTimestamp;

const RETRY_INTERVAL: Duration = Duration::from_millis(1500);
const MAX_ATTEMPTS: u8 = 11;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(95);
const RENDEZVOUS_DELAY: Duration = Duration::from_secs(5);
const MANAGE_INTERVAL: Duration = Duration::from_millis(500);

/// What a handshake attempt is trying to reach
#[derive(Debug, PartialEq, Clone)]
pub enum HandshakeTarget {
    Server { url: String },
    Peer { peer_id: [u8; PEER_ID_SIZE] },
}

/// Which side of which kind of handshake produced a session
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HandshakeRole {
    Client,
    P2pInitiator,
    P2pResponder,
}

/// Everything a fully keyed session needs to start exchanging encrypted packets
#[derive(Debug, Clone)]
pub struct EstablishedSession {
    pub local_id: u32,
    pub far_id: u32,
    pub peer_address: SocketAddr,
    pub send_key: [u8; KEY_SIZE],
    pub recv_key: [u8; KEY_SIZE],
    pub role: HandshakeRole,
    pub far_peer_id: Option<[u8; PEER_ID_SIZE]>,
    pub target: HandshakeTarget,
}

/// A single result that is returned when the handshaker reacts to packets or timers
#[derive(Debug)]
pub enum HandshakerResult {
    /// A sealed datagram that must be sent to the given address
    OutboundPacket { to: SocketAddr, bytes: Vec<u8> },

    /// A handshake completed; the caller owns the new session from here on
    SessionEstablished(Box<EstablishedSession>),

    /// A handshake attempt gave up, either after its retry budget or its lifetime
    HandshakeFailed {
        target: HandshakeTarget,
        description: String,
    },
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum PendingStatus {
    Handshake30Sent,
    Handshake38Sent,
}

struct PendingHandshake {
    target: HandshakeTarget,
    status: PendingStatus,
    local_id: u32,
    cookie: Option<Vec<u8>>,
    nonce: Option<Vec<u8>>,
    host_address: Option<SocketAddr>,
    candidates: BTreeMap<SocketAddr, AddressType>,
    active_address: Option<SocketAddr>,
    attempts: u8,
    last_attempt: Instant,
    created: Instant,
    rendezvous_delayed: bool,
}

struct IssuedCookie {
    peer_address: SocketAddr,
    created: Instant,
}

/// Drives every handshake of one engine: initiator attempts indexed by tag, responder
/// cookies indexed by value, and the engine's long lived key material.
pub struct Handshaker {
    started: Instant,
    dh: DiffieHellman,
    certificate: Vec<u8>,
    peer_id: [u8; PEER_ID_SIZE],
    default_cipher: RtmfpCipher,
    pending: HashMap<[u8; TAG_SIZE], PendingHandshake>,
    cookies: HashMap<Vec<u8>, IssuedCookie>,
    next_local_id: u32,
    last_manage: Option<Instant>,
}

impl Handshaker {
    pub fn new(now: Instant) -> Handshaker {
        let certificate = keying::generate_certificate();
        let peer_id = peer_id_from_certificate(&certificate);

        Handshaker {
            started: now,
            dh: DiffieHellman::new(),
            certificate,
            peer_id,
            default_cipher: RtmfpCipher::default_key(),
            pending: HashMap::new(),
            cookies: HashMap::new(),
            next_local_id: 1,
            last_manage: None,
        }
    }

    /// Our own peer id, the SHA-256 of the certificate presented in second round packets
    pub fn peer_id(&self) -> [u8; PEER_ID_SIZE] {
        self.peer_id
    }

    pub fn peer_id_hex(&self) -> String {
        peer_id_to_hex(&self.peer_id)
    }

    /// Starts a client-to-server handshake towards a resolved rtmfp url
    pub fn start_server_handshake(
        &mut self,
        url: String,
        addresses: Vec<SocketAddr>,
        now: Instant,
    ) -> Result<Vec<HandshakerResult>, HandshakeError> {
        let tag = keying::generate_tag();
        let mut candidates = BTreeMap::new();
        for address in addresses {
            candidates.insert(address, AddressType::Public);
        }

        let handshake = PendingHandshake {
            target: HandshakeTarget::Server { url },
            status: PendingStatus::Handshake30Sent,
            local_id: self.allocate_local_id(),
            cookie: None,
            nonce: None,
            host_address: None,
            candidates,
            active_address: None,
            attempts: 1,
            last_attempt: now,
            created: now,
            rendezvous_delayed: false,
        };

        let results = self.send_first_round(&tag, &handshake, now)?;
        self.pending.insert(tag, handshake);
        Ok(results)
    }

    /// Starts a peer-to-peer handshake: direct first round packets to every known candidate
    /// address plus, unless delayed, the rendezvous service of the server
    pub fn start_peer_handshake(
        &mut self,
        peer_id: [u8; PEER_ID_SIZE],
        addresses: Vec<(SocketAddr, AddressType)>,
        host_address: Option<SocketAddr>,
        rendezvous_delayed: bool,
        now: Instant,
    ) -> Result<Vec<HandshakerResult>, HandshakeError> {
        let tag = keying::generate_tag();
        let mut candidates = BTreeMap::new();
        for (address, kind) in addresses {
            candidates.insert(address, kind);
        }

        let handshake = PendingHandshake {
            target: HandshakeTarget::Peer { peer_id },
            status: PendingStatus::Handshake30Sent,
            local_id: self.allocate_local_id(),
            cookie: None,
            nonce: None,
            host_address,
            candidates,
            active_address: None,
            attempts: 1,
            last_attempt: now,
            created: now,
            rendezvous_delayed,
        };

        let results = self.send_first_round(&tag, &handshake, now)?;
        self.pending.insert(tag, handshake);
        Ok(results)
    }

    /// Handles the chunks of one decoded handshake datagram.  `session_id` is the packed id
    /// the datagram arrived under (zero for first round traffic, our proposed id for the
    /// final responder packet).
    pub fn handle_packet(
        &mut self,
        from: SocketAddr,
        session_id: u32,
        chunks: &[u8],
        now: Instant,
    ) -> Result<Vec<HandshakerResult>, HandshakeError> {
        let mut results = Vec::new();
        let mut reader = ChunkReader::new(chunks);

        while let Some((type_id, payload)) = reader.next_chunk()? {
            match type_id {
                HANDSHAKE_30 => self.handle_handshake_30(from, payload, now, &mut results)?,
                HANDSHAKE_70 => self.handle_handshake_70(from, payload, now, &mut results)?,
                HANDSHAKE_38 => self.handle_handshake_38(from, payload, now, &mut results)?,
                HANDSHAKE_78 => {
                    self.handle_handshake_78(from, session_id, payload, &mut results)?
                }
                HANDSHAKE_REDIRECTION => {
                    self.handle_redirection(payload, now, &mut results)?
                }
                _ => trace!(type_id, "Ignoring unknown handshake chunk"),
            }
        }

        Ok(results)
    }

    /// Handles a p2p address exchange relayed through a connected session: a far peer is
    /// about to contact us, so we greet every announced address with a first round reply.
    pub fn handle_p2p_address_exchange(
        &mut self,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<HandshakerResult>, HandshakeError> {
        let mut cursor = Cursor::new(payload);
        let mut tag_length = [0_u8; 1];
        cursor.read_exact(&mut tag_length)?;
        if tag_length[0] as usize != TAG_SIZE {
            return Err(HandshakeError::MalformedPacket);
        }

        let mut tag = [0_u8; TAG_SIZE];
        cursor.read_exact(&mut tag)?;

        let mut results = Vec::new();
        while (cursor.position() as usize) < payload.len() {
            let (address, _) = read_address(&mut cursor)?;
            results.push(self.send_handshake_70(tag, address, now)?);
        }

        Ok(results)
    }

    /// Retries pending attempts and prunes expired handshakes and cookies.  Runs its real
    /// work at most every 500 milliseconds regardless of the caller's tick rate.
    pub fn manage(&mut self, now: Instant) -> Vec<HandshakerResult> {
        if let Some(last) = self.last_manage {
            if now.duration_since(last) < MANAGE_INTERVAL {
                return Vec::new();
            }
        }
        self.last_manage = Some(now);

        let mut results = Vec::new();
        let mut failed_tags = Vec::new();

        let tags: Vec<[u8; TAG_SIZE]> = self.pending.keys().copied().collect();
        for tag in tags {
            let (expired, exhausted) = {
                let handshake = &self.pending[&tag];
                let expired = now.duration_since(handshake.created) >= HANDSHAKE_TIMEOUT;
                let retry_due =
                    now.duration_since(handshake.last_attempt) >= RETRY_INTERVAL;
                let exhausted = retry_due && handshake.attempts >= MAX_ATTEMPTS;

                if !expired && !exhausted && retry_due {
                    if let Some(handshake) = self.pending.get_mut(&tag) {
                        handshake.attempts += 1;
                        handshake.last_attempt = now;
                    }

                    let handshake = &self.pending[&tag];
                    debug!(
                        attempt = handshake.attempts,
                        "Retrying handshake (status {:?})", handshake.status
                    );
                    match handshake.status {
                        PendingStatus::Handshake30Sent => {
                            if let Ok(mut sent) = self.send_first_round(&tag, handshake, now) {
                                results.append(&mut sent);
                            }
                        }
                        PendingStatus::Handshake38Sent => {
                            if let Ok(mut sent) = self.resend_second_round(&tag, now) {
                                results.append(&mut sent);
                            }
                        }
                    }

                    (false, false)
                } else {
                    (expired, exhausted)
                }
            };

            if expired || exhausted {
                failed_tags.push((tag, exhausted));
            }
        }

        for (tag, exhausted) in failed_tags {
            if let Some(handshake) = self.pending.remove(&tag) {
                let description = if exhausted {
                    format!("Handshake failed after {} attempts", MAX_ATTEMPTS)
                } else {
                    "Handshake expired".to_string()
                };

                warn!(%description, "Abandoning handshake");
                results.push(HandshakerResult::HandshakeFailed {
                    target: handshake.target,
                    description,
                });
            }
        }

        self.cookies
            .retain(|_, cookie| now.duration_since(cookie.created) < HANDSHAKE_TIMEOUT);

        results
    }

    fn handle_handshake_30(
        &mut self,
        from: SocketAddr,
        payload: &[u8],
        now: Instant,
        results: &mut Vec<HandshakerResult>,
    ) -> Result<(), HandshakeError> {
        let packet = Handshake30::parse(payload)?;
        match packet.epd {
            Epd::PeerId(peer_id) if peer_id == self.peer_id => {
                results.push(self.send_handshake_70(packet.tag, from, now)?);
            }
            Epd::PeerId(_) => {
                trace!("First round packet for a different peer id, ignoring");
            }
            Epd::Url(_) => {
                trace!("First round packet with a url discriminator, this client is not a server");
            }
        }

        Ok(())
    }

    fn handle_handshake_70(
        &mut self,
        from: SocketAddr,
        payload: &[u8],
        now: Instant,
        results: &mut Vec<HandshakerResult>,
    ) -> Result<(), HandshakeError> {
        let packet = Handshake70::parse(payload)?;
        let handshake = match self.pending.get_mut(&packet.tag) {
            Some(x) => x,
            None => {
                debug!("Cookie reply carried an unknown tag, ignoring");
                return Ok(());
            }
        };

        if handshake.status != PendingStatus::Handshake30Sent {
            trace!("Duplicate cookie reply, ignoring");
            return Ok(());
        }

        if packet.far_key.len() != DH_KEY_SIZE {
            return Err(HandshakeError::BadFarKeySize {
                size: packet.far_key.len(),
            });
        }

        handshake.status = PendingStatus::Handshake38Sent;
        handshake.cookie = Some(packet.cookie.clone());
        handshake.nonce = Some(keying::generate_nonce());
        handshake.active_address = Some(from);
        handshake.attempts = 1;
        handshake.last_attempt = now;

        let reply = Handshake38 {
            session_id: handshake.local_id,
            cookie: packet.cookie,
            public_key: self.dh.public_key().to_vec(),
            nonce: handshake.nonce.clone().unwrap_or_default(),
            certificate: self.certificate.clone(),
        };

        results.push(self.seal(from, |packet| reply.write(packet), now)?);
        Ok(())
    }

    fn handle_handshake_38(
        &mut self,
        from: SocketAddr,
        payload: &[u8],
        now: Instant,
        results: &mut Vec<HandshakerResult>,
    ) -> Result<(), HandshakeError> {
        let packet = Handshake38::parse(payload)?;
        let issued = match self.cookies.remove(&packet.cookie) {
            Some(x) => x,
            None => {
                debug!("Second round packet referenced an unknown cookie, ignoring");
                return Ok(());
            }
        };

        if issued.peer_address != from {
            trace!(
                "Second round packet arrived from a different address than the first round"
            );
        }

        if packet.public_key.len() != DH_KEY_SIZE {
            return Err(HandshakeError::BadFarKeySize {
                size: packet.public_key.len(),
            });
        }

        let local_id = self.allocate_local_id();
        let responder_nonce = keying::generate_nonce();
        let shared_secret = self.dh.shared_secret(&packet.public_key);
        let (request_key, response_key) =
            compute_asymmetric_keys(&shared_secret, &packet.nonce, &responder_nonce);

        let far_peer_id = peer_id_from_certificate(&packet.certificate);

        let reply = Handshake78 {
            session_id: local_id,
            public_key: self.dh.public_key().to_vec(),
            nonce: responder_nonce,
        };

        results.push(self.seal(from, |buffer| reply.write(buffer), now)?);
        results.push(HandshakerResult::SessionEstablished(Box::new(
            EstablishedSession {
                local_id,
                far_id: packet.session_id,
                peer_address: from,
                send_key: response_key,
                recv_key: request_key,
                role: HandshakeRole::P2pResponder,
                far_peer_id: Some(far_peer_id),
                target: HandshakeTarget::Peer {
                    peer_id: far_peer_id,
                },
            },
        )));

        debug!(
            peer = %peer_id_to_hex(&far_peer_id),
            "Responder handshake completed"
        );
        Ok(())
    }

    fn handle_handshake_78(
        &mut self,
        from: SocketAddr,
        session_id: u32,
        payload: &[u8],
        results: &mut Vec<HandshakerResult>,
    ) -> Result<(), HandshakeError> {
        let packet = Handshake78::parse(payload)?;

        let tag = match self
            .pending
            .iter()
            .find(|(_, handshake)| {
                handshake.local_id == session_id
                    && handshake.status == PendingStatus::Handshake38Sent
            })
            .map(|(tag, _)| *tag)
        {
            Some(tag) => tag,
            None => {
                debug!("Final round packet matched no handshake in progress, ignoring");
                return Ok(());
            }
        };

        if packet.public_key.len() != DH_KEY_SIZE {
            return Err(HandshakeError::BadFarKeySize {
                size: packet.public_key.len(),
            });
        }

        let handshake = self.pending.remove(&tag).expect("tag was just found");
        let initiator_nonce = handshake.nonce.clone().unwrap_or_default();
        let shared_secret = self.dh.shared_secret(&packet.public_key);
        let (request_key, response_key) =
            compute_asymmetric_keys(&shared_secret, &initiator_nonce, &packet.nonce);

        let (role, far_peer_id) = match &handshake.target {
            HandshakeTarget::Server { .. } => (HandshakeRole::Client, None),
            HandshakeTarget::Peer { peer_id } => (HandshakeRole::P2pInitiator, Some(*peer_id)),
        };

        results.push(HandshakerResult::SessionEstablished(Box::new(
            EstablishedSession {
                local_id: handshake.local_id,
                far_id: packet.session_id,
                peer_address: handshake.active_address.unwrap_or(from),
                send_key: request_key,
                recv_key: response_key,
                role,
                far_peer_id,
                target: handshake.target,
            },
        )));

        debug!(far_id = packet.session_id, "Initiator handshake completed");
        Ok(())
    }

    fn handle_redirection(
        &mut self,
        payload: &[u8],
        now: Instant,
        results: &mut Vec<HandshakerResult>,
    ) -> Result<(), HandshakeError> {
        let packet = Redirection::parse(payload)?;
        let tag = packet.tag;
        if !self.pending.contains_key(&tag) {
            debug!("Redirection carried an unknown tag, ignoring");
            return Ok(());
        }

        let mut new_addresses = Vec::new();
        {
            let handshake = self.pending.get_mut(&tag).expect("presence checked above");
            for (address, kind) in packet.addresses {
                match kind {
                    AddressType::Local | AddressType::Public => {
                        if handshake.candidates.insert(address, kind).is_none() {
                            new_addresses.push(address);
                        }
                    }
                    AddressType::Redirection => {
                        if handshake.host_address != Some(address) {
                            handshake.host_address = Some(address);
                            new_addresses.push(address);
                        }
                    }
                    AddressType::Unspecified => {
                        // An empty rendezvous answer: the target peer is unknown or offline
                        debug!("Rendezvous reported the peer as unreachable");
                    }
                }
            }
        }

        let handshake = &self.pending[&tag];
        if handshake.status == PendingStatus::Handshake30Sent {
            for address in new_addresses {
                results.push(self.build_handshake_30(&tag, handshake, address, now)?);
            }
        }

        Ok(())
    }

    fn send_first_round(
        &self,
        tag: &[u8; TAG_SIZE],
        handshake: &PendingHandshake,
        now: Instant,
    ) -> Result<Vec<HandshakerResult>, HandshakeError> {
        let mut results = Vec::new();
        for address in handshake.candidates.keys() {
            results.push(self.build_handshake_30(tag, handshake, *address, now)?);
        }

        if let Some(host) = handshake.host_address {
            let delay_over =
                now.duration_since(handshake.created) >= RENDEZVOUS_DELAY;
            if !handshake.rendezvous_delayed || delay_over {
                results.push(self.build_handshake_30(tag, handshake, host, now)?);
            }
        }

        Ok(results)
    }

    fn resend_second_round(
        &self,
        tag: &[u8; TAG_SIZE],
        now: Instant,
    ) -> Result<Vec<HandshakerResult>, HandshakeError> {
        let handshake = &self.pending[tag];
        let to = match handshake.active_address {
            Some(x) => x,
            None => return Ok(Vec::new()),
        };

        let reply = Handshake38 {
            session_id: handshake.local_id,
            cookie: handshake.cookie.clone().unwrap_or_default(),
            public_key: self.dh.public_key().to_vec(),
            nonce: handshake.nonce.clone().unwrap_or_default(),
            certificate: self.certificate.clone(),
        };

        Ok(vec![self.seal(to, |packet| reply.write(packet), now)?])
    }

    fn build_handshake_30(
        &self,
        tag: &[u8; TAG_SIZE],
        handshake: &PendingHandshake,
        to: SocketAddr,
        now: Instant,
    ) -> Result<HandshakerResult, HandshakeError> {
        let epd = match &handshake.target {
            HandshakeTarget::Server { url } => Epd::Url(url.clone()),
            HandshakeTarget::Peer { peer_id } => Epd::PeerId(*peer_id),
        };

        let packet = Handshake30 { epd, tag: *tag };
        self.seal(to, |buffer| packet.write(buffer), now)
    }

    fn send_handshake_70(
        &mut self,
        tag: [u8; TAG_SIZE],
        to: SocketAddr,
        now: Instant,
    ) -> Result<HandshakerResult, HandshakeError> {
        let cookie = keying::generate_cookie();
        self.cookies.insert(
            cookie.clone(),
            IssuedCookie {
                peer_address: to,
                created: now,
            },
        );

        let reply = Handshake70 {
            tag,
            cookie,
            far_key: self.dh.public_key().to_vec(),
        };

        self.seal(to, |packet| reply.write(packet), now)
    }

    fn seal(
        &self,
        to: SocketAddr,
        write_chunk: impl FnOnce(&mut Vec<u8>) -> Result<(), MessageSerializationError>,
        now: Instant,
    ) -> Result<HandshakerResult, HandshakeError> {
        let mut packet = init_packet(MARKER_HANDSHAKE, self.wire_time(now));
        write_chunk(&mut packet)?;
        let bytes = encode(&self.default_cipher, 0, packet)?;
        Ok(HandshakerResult::OutboundPacket { to, bytes })
    }

    fn wire_time(&self, now: Instant) -> RtmfpTimestamp {
        RtmfpTimestamp::from_millis(now.duration_since(self.started).as_millis() as u64)
    }

    fn allocate_local_id(&mut self) -> u32 {
        let id = self.next_local_id;
        self.next_local_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_io::decode;

    fn address(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn pump(
        from: SocketAddr,
        receiver: &mut Handshaker,
        bytes: &[u8],
        now: Instant,
    ) -> Vec<HandshakerResult> {
        let decoded = decode(&RtmfpCipher::default_key(), bytes).unwrap();
        assert_eq!(decoded.marker & 0x0B, 0x0B, "Handshake packets carry the 0x0B marker");
        receiver
            .handle_packet(from, decoded.session_id, &decoded.chunks, now)
            .unwrap()
    }

    #[test]
    fn two_handshakers_can_establish_a_p2p_session_against_each_other() {
        let now = Instant::now();
        let mut initiator = Handshaker::new(now);
        let mut responder = Handshaker::new(now);
        let initiator_address = address(10000);
        let responder_address = address(10001);

        let first_round = initiator
            .start_peer_handshake(responder.peer_id(), vec![(responder_address, AddressType::Public)], None, false, now)
            .unwrap();
        assert_eq!(first_round.len(), 1, "Expected a single first round packet");

        // Initiator -> responder: HS30, answered with HS70
        let cookie_reply = match &first_round[0] {
            HandshakerResult::OutboundPacket { to, bytes } => {
                assert_eq!(*to, responder_address, "First round sent to the wrong address");
                pump(initiator_address, &mut responder, bytes, now)
            }
            x => panic!("Expected an outbound packet, got {:?}", x),
        };

        // Responder -> initiator: HS70, answered with HS38
        let second_round = match &cookie_reply[0] {
            HandshakerResult::OutboundPacket { bytes, .. } => {
                pump(responder_address, &mut initiator, bytes, now)
            }
            x => panic!("Expected an outbound packet, got {:?}", x),
        };

        // Initiator -> responder: HS38, answered with HS78 + established session
        let final_round = match &second_round[0] {
            HandshakerResult::OutboundPacket { bytes, .. } => {
                pump(initiator_address, &mut responder, bytes, now)
            }
            x => panic!("Expected an outbound packet, got {:?}", x),
        };

        assert_eq!(final_round.len(), 2, "Responder should emit HS78 and a session");
        let responder_session = match &final_round[1] {
            HandshakerResult::SessionEstablished(session) => session.clone(),
            x => panic!("Expected an established session, got {:?}", x),
        };

        // Responder -> initiator: HS78 completes the initiator side
        let initiator_done = match &final_round[0] {
            HandshakerResult::OutboundPacket { bytes, .. } => {
                pump(responder_address, &mut initiator, bytes, now)
            }
            x => panic!("Expected an outbound packet, got {:?}", x),
        };

        let initiator_session = match &initiator_done[0] {
            HandshakerResult::SessionEstablished(session) => session.clone(),
            x => panic!("Expected an established session, got {:?}", x),
        };

        assert_eq!(initiator_session.role, HandshakeRole::P2pInitiator);
        assert_eq!(responder_session.role, HandshakeRole::P2pResponder);
        assert_eq!(
            initiator_session.send_key, responder_session.recv_key,
            "Initiator send key must match responder receive key"
        );
        assert_eq!(
            initiator_session.recv_key, responder_session.send_key,
            "Initiator receive key must match responder send key"
        );
        assert_eq!(
            initiator_session.far_id, responder_session.local_id,
            "Initiator far id must be the responder local id"
        );
        assert_eq!(
            responder_session.far_id, initiator_session.local_id,
            "Responder far id must be the initiator local id"
        );
        assert_ne!(initiator_session.far_id, 0, "Connected sessions have nonzero far ids");
        assert_eq!(
            responder_session.far_peer_id,
            Some(initiator.peer_id()),
            "Responder learned the wrong peer id"
        );
    }

    #[test]
    fn handshake_fails_after_eleven_attempts() {
        let mut now = Instant::now();
        let mut handshaker = Handshaker::new(now);

        handshaker
            .start_server_handshake(
                "rtmfp://example/app".to_string(),
                vec![address(20000)],
                now,
            )
            .unwrap();

        let mut failed = None;
        for _ in 0..40 {
            now += Duration::from_millis(1500);
            for result in handshaker.manage(now) {
                if let HandshakerResult::HandshakeFailed { description, .. } = result {
                    failed = Some(description);
                }
            }
            if failed.is_some() {
                break;
            }
        }

        let description = failed.expect("Handshake never failed");
        assert!(
            description.contains("11"),
            "Failure should mention the retry budget: {}",
            description
        );
    }

    #[test]
    fn expired_cookies_are_pruned() {
        let now = Instant::now();
        let mut responder = Handshaker::new(now);
        let mut initiator = Handshaker::new(now);

        let first_round = initiator
            .start_peer_handshake(
                responder.peer_id(),
                vec![(address(30000), AddressType::Public)],
                None,
                false,
                now,
            )
            .unwrap();

        match &first_round[0] {
            HandshakerResult::OutboundPacket { bytes, .. } => {
                pump(address(30001), &mut responder, bytes, now);
            }
            x => panic!("Expected an outbound packet, got {:?}", x),
        }
        assert_eq!(responder.cookies.len(), 1, "A cookie should have been issued");

        responder.manage(now + Duration::from_secs(96));
        assert_eq!(responder.cookies.len(), 0, "The cookie should have expired");
    }

    #[test]
    fn rendezvous_contact_is_delayed_when_requested() {
        let now = Instant::now();
        let mut handshaker = Handshaker::new(now);
        let direct = address(40000);
        let host = address(40001);

        let results = handshaker
            .start_peer_handshake(
                [5_u8; PEER_ID_SIZE],
                vec![(direct, AddressType::Public)],
                Some(host),
                true,
                now,
            )
            .unwrap();

        let targets: Vec<SocketAddr> = results
            .iter()
            .filter_map(|result| match result {
                HandshakerResult::OutboundPacket { to, .. } => Some(*to),
                _ => None,
            })
            .collect();

        assert!(targets.contains(&direct), "Direct candidate was not contacted");
        assert!(!targets.contains(&host), "Rendezvous was contacted before the delay");

        // After five seconds the retry includes the rendezvous service
        let later = now + Duration::from_secs(6);
        let retried = handshaker.manage(later);
        let targets: Vec<SocketAddr> = retried
            .iter()
            .filter_map(|result| match result {
                HandshakerResult::OutboundPacket { to, .. } => Some(*to),
                _ => None,
            })
            .collect();

        assert!(
            targets.contains(&host),
            "Rendezvous was not contacted after the delay elapsed"
        );
    }
}
