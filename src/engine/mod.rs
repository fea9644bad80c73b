//! The top of the protocol engine: one [`RtmfpEngine`] owns the handshaker, every session,
//! the Flash command binding, the publication and the NetGroup.
//!
//! The engine is sans-IO: the embedding application reads UDP datagrams and feeds them to
//! [`RtmfpEngine::handle_datagram`], ticks [`RtmfpEngine::manage`] every ~50 milliseconds,
//! and sends every returned packet in order.  All protocol state mutates on whichever
//! thread does that pumping; raised events can be handed to a worker lane for user
//! callbacks.  Several engines can coexist in one process.

mod config;
mod errors;
mod events;
mod result;
#[cfg(test)]
mod tests;

pub use self::config::EngineConfig;
pub use self::errors::EngineError;
pub use self::events::EngineEvent;
pub use self::result::EngineResult;

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::flash::{
    media_id_from_signature, stream_signature, FlashConnection, FlashEvent, FlashMessage,
    MAIN_FLOW_SIGNATURE,
};
use crate::group::{
    group_id_hex, GroupBuffer, GroupConfig, GroupMedia, GroupMediaAction, GroupMessage,
};
use crate::handshake::{
    peer_id_from_hex, peer_id_to_hex, EstablishedSession, HandshakeRole, HandshakeTarget,
    Handshaker, HandshakerResult,
};
use crate::messages::AddressType;
use crate::packet_io::unpack_session_id;
use crate::publisher::Publisher;
use crate::sessions::{
    CloseReason, RtmfpSession, SessionEvent, SessionResult, SessionStatus, UdpPacket,
};

// Flow signatures of the group layer: "GC" flows talk to the server rendezvous, "GR" flows
// talk to group peers
const GROUP_SERVER_SIGNATURE: &[u8] = &[0x00, 0x47, 0x43];
const GROUP_PEER_SIGNATURE: &[u8] = &[0x00, 0x47, 0x52, 0x11];

// Marker of a member announcement on the server group flow
const GROUP_MEMBER: u8 = 0x0B;

// Listener id of the group fan-out inside the publisher
const GROUP_LISTENER: &str = "netgroup";

enum StreamCommand {
    Publish { name: String },
    Play { name: String },
}

struct GroupState {
    id_hex: String,
    media: GroupMedia,
    buffer: GroupBuffer,
    peer_sessions: HashMap<String, u32>,
    peer_writers: HashMap<String, u64>,
}

/// A client engine speaking RTMFP: server connection, peer-to-peer sessions and NetGroup
/// media distribution behind one sans-IO surface.
pub struct RtmfpEngine {
    config: EngineConfig,
    handshaker: Handshaker,
    sessions: HashMap<u32, RtmfpSession>,
    main_session: Option<u32>,
    server_url: Option<String>,
    server_app: Option<String>,
    flash: FlashConnection,
    main_writer: Option<u64>,
    group_server_writer: Option<u64>,
    stream_writers: HashMap<u16, u64>,
    pending_streams: HashMap<u16, StreamCommand>,
    next_media_id: u16,
    publisher: Option<Publisher>,
    group: Option<GroupState>,
}

impl RtmfpEngine {
    pub fn new(config: EngineConfig, now: Instant) -> RtmfpEngine {
        RtmfpEngine {
            config,
            handshaker: Handshaker::new(now),
            sessions: HashMap::new(),
            main_session: None,
            server_url: None,
            server_app: None,
            flash: FlashConnection::new(),
            main_writer: None,
            group_server_writer: None,
            stream_writers: HashMap::new(),
            pending_streams: HashMap::new(),
            next_media_id: 1,
            publisher: None,
            group: None,
        }
    }

    /// Our peer id in lower case hex, as other peers address us
    pub fn peer_id_hex(&self) -> String {
        self.handshaker.peer_id_hex()
    }

    /// True once the server session is connected
    pub fn is_connected(&self) -> bool {
        self.main_session
            .and_then(|id| self.sessions.get(&id))
            .map(|session| session.status() == SessionStatus::Connected)
            .unwrap_or(false)
    }

    /// Starts the connection to an rtmfp url resolved to one or more server addresses.
    /// The `connect` invocation ships automatically once the handshake completes.
    pub fn connect(
        &mut self,
        url: &str,
        addresses: Vec<SocketAddr>,
        now: Instant,
    ) -> Result<Vec<EngineResult>, EngineError> {
        if self.main_session.is_some() || self.server_url.is_some() {
            return Err(EngineError::AlreadyConnected);
        }

        self.server_url = Some(url.to_string());
        self.server_app = Some(application_of(url));

        let results = self
            .handshaker
            .start_server_handshake(url.to_string(), addresses, now)?;
        Ok(self.process_handshaker_results(results, now))
    }

    /// Starts a peer-to-peer connection to a peer id, via its known addresses and the
    /// rendezvous service of the connected server
    pub fn connect_to_peer(
        &mut self,
        peer_id_hex: &str,
        addresses: Vec<(SocketAddr, AddressType)>,
        rendezvous_delayed: bool,
        now: Instant,
    ) -> Result<Vec<EngineResult>, EngineError> {
        let peer_id = peer_id_from_hex(peer_id_hex).ok_or_else(|| EngineError::InvalidPeerId {
            peer_id: peer_id_hex.to_string(),
        })?;

        let host = self
            .main_session
            .and_then(|id| self.sessions.get(&id))
            .map(|session| session.peer_address());

        let results =
            self.handshaker
                .start_peer_handshake(peer_id, addresses, host, rendezvous_delayed, now)?;
        Ok(self.process_handshaker_results(results, now))
    }

    /// Joins a NetGroup: derives the hashed group id, announces it to the server and
    /// prepares the media engine with the supplied parameters
    pub fn join_group(
        &mut self,
        group_name: &str,
        stream_name: &str,
        group_config: GroupConfig,
        now: Instant,
    ) -> Result<Vec<EngineResult>, EngineError> {
        let session_id = self.connected_session_id()?;
        let id_hex = group_id_hex(group_name);
        debug!(group = %id_hex, "Joining NetGroup");

        let window = group_config.window_duration;
        let is_publisher = group_config.is_publisher;
        self.group = Some(GroupState {
            id_hex: id_hex.clone(),
            media: GroupMedia::new(
                stream_name.to_string(),
                id_hex.as_bytes().to_vec(),
                group_config,
                now,
            ),
            buffer: GroupBuffer::new(window),
            peer_sessions: HashMap::new(),
            peer_writers: HashMap::new(),
        });

        if is_publisher {
            let publisher = self
                .publisher
                .get_or_insert_with(|| Publisher::new(stream_name.to_string(), true, false));
            publisher.start();
            publisher.add_listener(GROUP_LISTENER)?;
        }

        // Announce the group id on a dedicated flow so the server introduces members
        let session = self
            .sessions
            .get_mut(&session_id)
            .expect("connected session id was just checked");
        let writer = session.create_writer(GROUP_SERVER_SIGNATURE.to_vec(), None);
        self.group_server_writer = Some(writer);
        session.write_message(writer, Bytes::from(id_hex.into_bytes()), true)?;

        let flushed = session.flush(now)?;
        Ok(self.process_session_results(session_id, flushed, now))
    }

    /// Creates a stream and publishes on it once the server confirms the creation
    pub fn publish(
        &mut self,
        stream_name: &str,
        now: Instant,
    ) -> Result<Vec<EngineResult>, EngineError> {
        self.connected_session_id()?;
        let media_id = self.allocate_media_id();
        self.pending_streams.insert(
            media_id,
            StreamCommand::Publish {
                name: stream_name.to_string(),
            },
        );

        if self.publisher.is_none() {
            self.publisher = Some(Publisher::new(stream_name.to_string(), true, false));
        }

        self.send_create_stream(media_id, now)
    }

    /// Creates a stream and plays a published name on it
    pub fn play(
        &mut self,
        stream_name: &str,
        now: Instant,
    ) -> Result<Vec<EngineResult>, EngineError> {
        self.connected_session_id()?;
        let media_id = self.allocate_media_id();
        self.pending_streams.insert(
            media_id,
            StreamCommand::Play {
                name: stream_name.to_string(),
            },
        );

        self.send_create_stream(media_id, now)
    }

    /// Closes one stream: the closeStream invocation ships and the stream writer drains
    pub fn close_stream(
        &mut self,
        media_id: u16,
        now: Instant,
    ) -> Result<Vec<EngineResult>, EngineError> {
        let session_id = self.connected_session_id()?;
        let writer = self
            .stream_writers
            .remove(&media_id)
            .ok_or(EngineError::UnknownStream { media_id })?;

        let invocation = self.flash.close_stream_request(media_id)?;
        if let Some(publisher) = self.publisher.as_mut() {
            publisher.remove_listener(&media_listener(media_id));
        }

        let session = self
            .sessions
            .get_mut(&session_id)
            .expect("connected session id was just checked");
        session.write_message(writer, Bytes::from(invocation), true)?;
        session.close_writer(writer);

        let flushed = session.flush(now)?;
        Ok(self.process_session_results(session_id, flushed, now))
    }

    /// Feeds one published audio frame through every listener
    pub fn push_audio(
        &mut self,
        time: u32,
        payload: Bytes,
        now: Instant,
    ) -> Result<Vec<EngineResult>, EngineError> {
        match self.publisher.as_mut() {
            Some(publisher) => publisher.push_audio(time, payload),
            None => return Err(EngineError::NoPublication),
        }
        self.flush_publication(now)
    }

    /// Feeds one published video frame through every listener
    pub fn push_video(
        &mut self,
        time: u32,
        payload: Bytes,
        now: Instant,
    ) -> Result<Vec<EngineResult>, EngineError> {
        match self.publisher.as_mut() {
            Some(publisher) => publisher.push_video(time, payload),
            None => return Err(EngineError::NoPublication),
        }
        self.flush_publication(now)
    }

    /// Feeds one published data frame through every listener
    pub fn push_data(
        &mut self,
        time: u32,
        payload: Bytes,
        now: Instant,
    ) -> Result<Vec<EngineResult>, EngineError> {
        match self.publisher.as_mut() {
            Some(publisher) => publisher.push_data(time, payload),
            None => return Err(EngineError::NoPublication),
        }
        self.flush_publication(now)
    }

    /// Injects a data function call into the published group stream.  Only the publisher
    /// side creates fragments, so subscribers reject the call.
    pub fn call_group_function(
        &mut self,
        function: &str,
        arguments: &[String],
        now: Instant,
    ) -> Result<Vec<EngineResult>, EngineError> {
        let group = self.group.as_mut().ok_or(EngineError::NoGroup)?;
        if !group.media.config().is_publisher {
            return Err(EngineError::NoPublication);
        }

        let payload = FlashConnection::invocation_payload(function, arguments)?;
        let actions = group.media.publish_media(
            crate::flash::TYPE_DATA_AMF3,
            0,
            Bytes::from(payload),
            true,
            now,
        );

        self.process_group_actions(actions, now)
    }

    /// Routes one received datagram: session traffic by its packed id, everything else to
    /// the handshaker
    pub fn handle_datagram(
        &mut self,
        from: SocketAddr,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Vec<EngineResult>, EngineError> {
        if datagram.len() < crate::packet_io::MIN_PACKET_SIZE {
            trace!(size = datagram.len(), "Dropping a runt datagram");
            return Ok(Vec::new());
        }

        let session_id = unpack_session_id(datagram);
        if let Some(session) = self.sessions.get_mut(&session_id) {
            let results = session.handle_datagram(datagram, now)?;
            return Ok(self.process_session_results(session_id, results, now));
        }

        // Unknown session: this is handshake traffic under the default key, or noise
        let decoded = match crate::packet_io::decode(
            &crate::packet_io::RtmfpCipher::default_key(),
            datagram,
        ) {
            Ok(x) => x,
            Err(error) => {
                trace!(%error, "Dropping a datagram for an unknown session");
                return Ok(Vec::new());
            }
        };

        let results =
            self.handshaker
                .handle_packet(from, decoded.session_id, &decoded.chunks, now)?;
        Ok(self.process_handshaker_results(results, now))
    }

    /// Runs every periodic duty: handshake retries, session keep-alive and retransmission,
    /// group availability/pull/push and buffered delivery.  Call roughly every 50ms.
    pub fn manage(&mut self, now: Instant) -> Result<Vec<EngineResult>, EngineError> {
        let mut results = Vec::new();

        let handshake_results = self.handshaker.manage(now);
        results.append(&mut self.process_handshaker_results(handshake_results, now));

        let session_ids: Vec<u32> = self.sessions.keys().copied().collect();
        for session_id in session_ids {
            let managed = match self.sessions.get_mut(&session_id) {
                Some(session) => session.manage(now)?,
                None => continue,
            };
            results.append(&mut self.process_session_results(session_id, managed, now));
        }

        // Free sessions that died
        let dead: Vec<u32> = self
            .sessions
            .iter()
            .filter(|(_, session)| {
                session.status() == SessionStatus::Failed
                    || session.status() == SessionStatus::Closed
            })
            .map(|(id, _)| *id)
            .collect();
        for session_id in dead {
            self.forget_session(session_id, &mut results);
        }

        if let Some(group) = self.group.as_mut() {
            let (actions, alive) = group.media.manage(now);
            if alive {
                let mut produced = self.process_group_actions(actions, now)?;
                results.append(&mut produced);

                if let Some(group) = self.group.as_mut() {
                    for message in group.buffer.manage(now) {
                        results.push(EngineResult::RaisedEvent(EngineEvent::GroupMediaReceived {
                            type_id: message.type_id,
                            time: message.time,
                            payload: message.payload,
                        }));
                    }
                }
            } else {
                debug!("Group media timed out");
                self.group = None;
                results.push(EngineResult::RaisedEvent(EngineEvent::GroupClosed {
                    reason: CloseReason::SessionClosed,
                }));
            }
        }

        Ok(results)
    }

    /// Closes everything: the group, every session and the publication
    pub fn close(&mut self, now: Instant) -> Result<Vec<EngineResult>, EngineError> {
        let mut results = Vec::new();

        if let Some(mut group) = self.group.take() {
            let mut actions = Vec::new();

            // A publishing group announces the unpublish before its end marker, so every
            // subscriber's player learns the stream stopped on purpose
            if group.media.config().is_publisher && self.publisher.is_some() {
                let stream_name = group.media.stream_name.clone();
                let unpublish = FlashConnection::status_payload(
                    "NetStream.Play.UnpublishNotify",
                    &format!("{} is now unpublished", stream_name),
                )?;
                actions.append(&mut group.media.publish_media(
                    crate::flash::TYPE_INVOCATION_AMF3,
                    0,
                    Bytes::from(unpublish),
                    true,
                    now,
                ));

                let close_stream = FlashConnection::invocation_payload("closeStream", &[])?;
                actions.append(&mut group.media.publish_media(
                    crate::flash::TYPE_INVOCATION_AMF3,
                    0,
                    Bytes::from(close_stream),
                    true,
                    now,
                ));
            }

            actions.append(&mut group.media.close(now));
            self.group = Some(group);
            results.append(&mut self.process_group_actions(actions, now)?);
            self.group = None;
            results.push(EngineResult::RaisedEvent(EngineEvent::GroupClosed {
                reason: CloseReason::SessionClosed,
            }));

            // The group announce flow towards the server ends with the group
            if let (Some(session_id), Some(writer)) =
                (self.main_session, self.group_server_writer.take())
            {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.close_writer(writer);
                }
            }
        }

        let session_ids: Vec<u32> = self.sessions.keys().copied().collect();
        for session_id in session_ids {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                let closed = session.close(CloseReason::SessionClosed, now)?;
                results.append(&mut self.process_session_results(session_id, closed, now));
            }
        }

        self.publisher = None;
        Ok(results)
    }

    fn send_create_stream(
        &mut self,
        media_id: u16,
        now: Instant,
    ) -> Result<Vec<EngineResult>, EngineError> {
        let session_id = self.connected_session_id()?;
        let writer = self.main_writer.ok_or(EngineError::NotConnected)?;
        let invocation = self.flash.create_stream_request(media_id)?;

        let session = self
            .sessions
            .get_mut(&session_id)
            .expect("connected session id was just checked");
        session.write_message(writer, Bytes::from(invocation), true)?;

        let flushed = session.flush(now)?;
        Ok(self.process_session_results(session_id, flushed, now))
    }

    fn flush_publication(&mut self, now: Instant) -> Result<Vec<EngineResult>, EngineError> {
        let frames = match self.publisher.as_mut() {
            Some(publisher) => publisher.flush(),
            None => return Ok(Vec::new()),
        };

        let mut results = Vec::new();
        let mut touched_sessions = Vec::new();

        for (listener_id, frame) in frames {
            if listener_id == GROUP_LISTENER {
                let actions = match self.group.as_mut() {
                    Some(group) => group.media.publish_media(
                        frame.type_id,
                        frame.time,
                        frame.payload,
                        frame.reliable,
                        now,
                    ),
                    None => continue,
                };
                results.append(&mut self.process_group_actions(actions, now)?);
                continue;
            }

            if let Some(media_id) = listener_media_id(&listener_id) {
                let session_id = match self.main_session {
                    Some(x) => x,
                    None => continue,
                };
                let writer = match self.stream_writers.get(&media_id) {
                    Some(x) => *x,
                    None => continue,
                };

                let message = FlashMessage {
                    type_id: frame.type_id,
                    time: frame.time,
                    payload: frame.payload,
                };
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.write_message(writer, Bytes::from(message.write()), frame.reliable)?;
                    if !touched_sessions.contains(&session_id) {
                        touched_sessions.push(session_id);
                    }
                }
            }
        }

        for session_id in touched_sessions {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                let flushed = session.flush(now)?;
                results.append(&mut self.process_session_results(session_id, flushed, now));
            }
        }

        if self
            .publisher
            .as_ref()
            .map(|publisher| publisher.is_congested())
            .unwrap_or(false)
        {
            warn!("Publication output stays congested");
            if let Some(session_id) = self.main_session {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    let closed = session.close(CloseReason::OutputCongested, now)?;
                    results.append(&mut self.process_session_results(session_id, closed, now));
                }
            }
        }

        Ok(results)
    }

    fn process_handshaker_results(
        &mut self,
        handshake_results: Vec<HandshakerResult>,
        now: Instant,
    ) -> Vec<EngineResult> {
        let mut results = Vec::new();

        for result in handshake_results {
            match result {
                HandshakerResult::OutboundPacket { to, bytes } => {
                    results.push(EngineResult::OutboundPacket(UdpPacket { to, bytes }));
                }

                HandshakerResult::SessionEstablished(established) => {
                    results.append(&mut self.adopt_session(*established, now));
                }

                HandshakerResult::HandshakeFailed {
                    target,
                    description,
                } => {
                    let code = match target {
                        HandshakeTarget::Server { .. } => "NetConnection.Connect.Failed",
                        HandshakeTarget::Peer { .. } => "NetGroup.Connect.Failed",
                    };
                    results.push(EngineResult::RaisedEvent(EngineEvent::StatusEvent {
                        code: code.to_string(),
                        description,
                    }));
                }
            }
        }

        results
    }

    fn adopt_session(
        &mut self,
        established: EstablishedSession,
        now: Instant,
    ) -> Vec<EngineResult> {
        let mut results = Vec::new();
        let local_id = established.local_id;
        let role = established.role;
        let far_peer_id = established.far_peer_id;

        let session = match RtmfpSession::new(established, self.config.session.clone(), now) {
            Ok(x) => x,
            Err(error) => {
                warn!(%error, "Unable to create the session");
                return results;
            }
        };
        self.sessions.insert(local_id, session);

        match role {
            HandshakeRole::Client => {
                self.main_session = Some(local_id);

                // The first outbound message of a connection is the connect invocation on
                // writer 2, the main command flow
                let app = self.server_app.clone().unwrap_or_default();
                let url = self.server_url.clone().unwrap_or_default();
                let invocation = match self.flash.connect_request(&app, &url) {
                    Ok(x) => x,
                    Err(error) => {
                        warn!(%error, "Unable to build the connect invocation");
                        return results;
                    }
                };

                let session = self
                    .sessions
                    .get_mut(&local_id)
                    .expect("session was just inserted");
                let writer = session.create_writer(MAIN_FLOW_SIGNATURE.to_vec(), None);
                self.main_writer = Some(writer);

                if session
                    .write_message(writer, Bytes::from(invocation), true)
                    .is_ok()
                {
                    if let Ok(flushed) = session.flush(now) {
                        results.append(&mut self.process_session_results(local_id, flushed, now));
                    }
                }
            }

            HandshakeRole::P2pInitiator | HandshakeRole::P2pResponder => {
                let peer_hex = far_peer_id.map(|id| peer_id_to_hex(&id)).unwrap_or_default();
                debug!(peer = %peer_hex, "Peer session connected");
                results.push(EngineResult::RaisedEvent(EngineEvent::PeerConnected {
                    peer_id: peer_hex.clone(),
                }));

                if let Some(group) = self.group.as_mut() {
                    group.peer_sessions.insert(peer_hex.clone(), local_id);
                    let actions = group.media.add_peer(peer_hex, now);
                    if let Ok(mut produced) = self.process_group_actions(actions, now) {
                        results.append(&mut produced);
                    }
                }
            }
        }

        results
    }

    fn process_session_results(
        &mut self,
        session_id: u32,
        session_results: Vec<SessionResult>,
        now: Instant,
    ) -> Vec<EngineResult> {
        let mut results = Vec::new();

        for result in session_results {
            match result {
                SessionResult::OutboundPacket(packet) => {
                    results.push(EngineResult::OutboundPacket(packet));
                }

                SessionResult::RaisedEvent(event) => {
                    self.process_session_event(session_id, event, now, &mut results);
                }
            }
        }

        results
    }

    fn process_session_event(
        &mut self,
        session_id: u32,
        event: SessionEvent,
        now: Instant,
        results: &mut Vec<EngineResult>,
    ) {
        match event {
            SessionEvent::MessageReceived {
                signature, payload, ..
            } => {
                self.route_flow_message(session_id, &signature, payload, now, results);
            }

            SessionEvent::FlowEnded { flow_id, .. } => {
                trace!(flow_id, "Flow ended");
            }

            SessionEvent::WriterFailed { writer_id } => {
                debug!(writer_id, "Writer failed");
            }

            SessionEvent::P2pAddressExchange { payload } => {
                match self.handshaker.handle_p2p_address_exchange(&payload, now) {
                    Ok(handshake_results) => {
                        results.append(&mut self.process_handshaker_results(handshake_results, now))
                    }
                    Err(error) => debug!(%error, "Malformed p2p address exchange"),
                }
            }

            SessionEvent::SessionClosed { reason } => {
                if Some(session_id) == self.main_session {
                    results.push(EngineResult::RaisedEvent(EngineEvent::SessionClosed {
                        reason,
                    }));
                } else {
                    self.drop_group_peer(session_id, results);
                }
            }

            SessionEvent::SessionFailed { description } => {
                if Some(session_id) == self.main_session {
                    results.push(EngineResult::RaisedEvent(EngineEvent::StatusEvent {
                        code: "NetConnection.Connect.Closed".to_string(),
                        description,
                    }));
                } else {
                    self.drop_group_peer(session_id, results);
                }
            }
        }
    }

    fn route_flow_message(
        &mut self,
        session_id: u32,
        signature: &[u8],
        payload: Bytes,
        now: Instant,
        results: &mut Vec<EngineResult>,
    ) {
        if signature == MAIN_FLOW_SIGNATURE {
            match self.flash.handle_command_message(&payload) {
                Ok(events) => {
                    for event in events {
                        self.process_flash_event(event, now, results);
                    }
                }
                Err(error) => debug!(%error, "Unreadable command message"),
            }
            return;
        }

        if let Some(media_id) = media_id_from_signature(signature) {
            match self.flash.handle_media_message(media_id, &payload) {
                Ok(events) => {
                    for event in events {
                        self.process_flash_event(event, now, results);
                    }
                }
                Err(error) => debug!(%error, "Unreadable media message"),
            }
            return;
        }

        if signature.starts_with(GROUP_PEER_SIGNATURE) {
            let peer_hex = match self
                .sessions
                .get(&session_id)
                .and_then(|session| session.far_peer_id())
            {
                Some(id) => peer_id_to_hex(&id),
                None => return,
            };

            match GroupMessage::parse(&payload) {
                Ok(message) => {
                    let actions = match self.group.as_mut() {
                        Some(group) => group.media.handle_message(&peer_hex, message, now),
                        None => return,
                    };
                    if let Ok(mut produced) = self.process_group_actions(actions, now) {
                        results.append(&mut produced);
                    }
                }
                Err(error) => debug!(%error, "Unreadable group message"),
            }
            return;
        }

        if signature.starts_with(GROUP_SERVER_SIGNATURE) {
            // The rendezvous introduces group members: 0x0B followed by the raw peer id
            if payload.len() == 33 && payload[0] == GROUP_MEMBER {
                let peer_hex = peer_id_to_hex(&payload[1..]);
                debug!(peer = %peer_hex, "Group member announced");
                results.push(EngineResult::RaisedEvent(EngineEvent::GroupPeerDiscovered {
                    peer_id: peer_hex.clone(),
                }));

                match self.connect_to_peer(&peer_hex, Vec::new(), true, now) {
                    Ok(mut produced) => results.append(&mut produced),
                    Err(error) => debug!(%error, "Unable to contact the announced member"),
                }
            }
            return;
        }

        trace!("Message on a flow with an unknown signature, ignored");
    }

    fn process_flash_event(
        &mut self,
        event: FlashEvent,
        now: Instant,
        results: &mut Vec<EngineResult>,
    ) {
        match event {
            FlashEvent::ConnectionSucceeded => {
                results.push(EngineResult::RaisedEvent(EngineEvent::StatusEvent {
                    code: "NetConnection.Connect.Success".to_string(),
                    description: String::new(),
                }));
            }

            FlashEvent::ConnectionFailed { description } => {
                results.push(EngineResult::RaisedEvent(EngineEvent::StatusEvent {
                    code: "NetConnection.Connect.Failed".to_string(),
                    description,
                }));
            }

            FlashEvent::StreamCreated {
                media_id,
                stream_id,
            } => {
                trace!(media_id, stream_id, "Stream created");
                if let Err(error) = self.open_stream(media_id, now, results) {
                    warn!(%error, media_id, "Unable to open the created stream");
                }
            }

            FlashEvent::StatusEvent { code, description } => {
                results.push(EngineResult::RaisedEvent(EngineEvent::StatusEvent {
                    code,
                    description,
                }));
            }

            FlashEvent::MediaReceived {
                media_id,
                type_id,
                time,
                payload,
            } => {
                results.push(EngineResult::RaisedEvent(EngineEvent::MediaReceived {
                    media_id,
                    type_id,
                    time,
                    payload,
                }));
            }

            FlashEvent::UnhandledInvocation { name, .. } => {
                trace!(%name, "Unhandled invocation");
            }
        }
    }

    // A createStream result arrived: open the stream writer and send the publish or play
    // invocation it was created for
    fn open_stream(
        &mut self,
        media_id: u16,
        now: Instant,
        results: &mut Vec<EngineResult>,
    ) -> Result<(), EngineError> {
        let session_id = self.connected_session_id()?;
        let command = match self.pending_streams.remove(&media_id) {
            Some(x) => x,
            None => return Ok(()),
        };

        let invocation = match &command {
            StreamCommand::Publish { name } => self.flash.publish_request(media_id, name)?,
            StreamCommand::Play { name } => self.flash.play_request(media_id, name)?,
        };

        let session = self
            .sessions
            .get_mut(&session_id)
            .expect("connected session id was just checked");
        let writer = session.create_writer(stream_signature(media_id), None);
        self.stream_writers.insert(media_id, writer);
        session.write_message(writer, Bytes::from(invocation), true)?;

        if let StreamCommand::Publish { .. } = command {
            if let Some(publisher) = self.publisher.as_mut() {
                publisher.start();
                let listener = media_listener(media_id);
                if let Err(error) = publisher.add_listener(&listener) {
                    debug!(%error, "Listener already present");
                }
            }
        }

        let flushed = session.flush(now)?;
        results.append(&mut self.process_session_results(session_id, flushed, now));
        Ok(())
    }

    fn process_group_actions(
        &mut self,
        actions: Vec<GroupMediaAction>,
        now: Instant,
    ) -> Result<Vec<EngineResult>, EngineError> {
        let mut results = Vec::new();
        let mut touched_sessions = Vec::new();

        for action in actions {
            match action {
                GroupMediaAction::SendToPeer {
                    peer_id,
                    message,
                    reliable,
                } => {
                    let (session_id, writer) = match self.group_peer_writer(&peer_id) {
                        Some(x) => x,
                        None => {
                            trace!(peer = %peer_id, "No session for the group peer, send dropped");
                            continue;
                        }
                    };

                    if let Some(session) = self.sessions.get_mut(&session_id) {
                        session.write_message(writer, Bytes::from(message.write()), reliable)?;
                        if !touched_sessions.contains(&session_id) {
                            touched_sessions.push(session_id);
                        }
                    }
                }

                GroupMediaAction::NewFragment(fragment) => {
                    if let Some(group) = self.group.as_mut() {
                        for message in group.buffer.push(&fragment, now) {
                            results.push(EngineResult::RaisedEvent(
                                EngineEvent::GroupMediaReceived {
                                    type_id: message.type_id,
                                    time: message.time,
                                    payload: message.payload,
                                },
                            ));
                        }
                    }
                }

                GroupMediaAction::RemovedFragments { first_kept } => {
                    if let Some(group) = self.group.as_mut() {
                        group.buffer.on_removed_fragments(first_kept);
                    }
                }

                GroupMediaAction::PullTimeout => {
                    warn!("Pull congestion timeout, closing the group");
                    self.group = None;
                    results.push(EngineResult::RaisedEvent(EngineEvent::GroupClosed {
                        reason: CloseReason::P2pPullTimeout,
                    }));
                    return Ok(results);
                }
            }
        }

        for session_id in touched_sessions {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                let flushed = session.flush(now)?;
                for result in flushed {
                    if let SessionResult::OutboundPacket(packet) = result {
                        results.push(EngineResult::OutboundPacket(packet));
                    }
                }
            }
        }

        Ok(results)
    }

    // Finds or creates the group flow writer towards one peer
    fn group_peer_writer(&mut self, peer_hex: &str) -> Option<(u32, u64)> {
        let group = self.group.as_mut()?;
        let session_id = *group.peer_sessions.get(peer_hex)?;

        if let Some(writer) = group.peer_writers.get(peer_hex) {
            if self
                .sessions
                .get(&session_id)
                .map(|session| session.writer_exists(*writer))
                .unwrap_or(false)
            {
                return Some((session_id, *writer));
            }
        }

        let session = self.sessions.get_mut(&session_id)?;
        let mut signature = GROUP_PEER_SIGNATURE.to_vec();
        signature.extend_from_slice(group.id_hex.as_bytes());
        let writer = session.create_writer(signature, None);
        group.peer_writers.insert(peer_hex.to_string(), writer);

        Some((session_id, writer))
    }

    fn drop_group_peer(&mut self, session_id: u32, results: &mut Vec<EngineResult>) {
        let peer_hex = match self.group.as_ref().and_then(|group| {
            group
                .peer_sessions
                .iter()
                .find(|(_, id)| **id == session_id)
                .map(|(peer, _)| peer.clone())
        }) {
            Some(x) => x,
            None => return,
        };

        if let Some(group) = self.group.as_mut() {
            group.peer_sessions.remove(&peer_hex);
            group.peer_writers.remove(&peer_hex);
            group.media.remove_peer(&peer_hex);
        }

        results.push(EngineResult::RaisedEvent(EngineEvent::PeerDisconnected {
            peer_id: peer_hex,
        }));
    }

    fn forget_session(&mut self, session_id: u32, results: &mut Vec<EngineResult>) {
        self.drop_group_peer(session_id, results);
        self.sessions.remove(&session_id);

        if Some(session_id) == self.main_session {
            self.main_session = None;
            self.main_writer = None;
            self.group_server_writer = None;
            self.stream_writers.clear();
        }
    }

    fn connected_session_id(&self) -> Result<u32, EngineError> {
        let session_id = self.main_session.ok_or(EngineError::NotConnected)?;
        let connected = self
            .sessions
            .get(&session_id)
            .map(|session| session.status() == SessionStatus::Connected)
            .unwrap_or(false);

        if connected {
            Ok(session_id)
        } else {
            Err(EngineError::NotConnected)
        }
    }

    fn allocate_media_id(&mut self) -> u16 {
        let id = self.next_media_id;
        self.next_media_id += 1;
        id
    }
}

fn application_of(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let without_scheme = match trimmed.find("://") {
        Some(index) => &trimmed[index + 3..],
        None => trimmed,
    };

    match without_scheme.find('/') {
        Some(index) => without_scheme[index + 1..].to_string(),
        None => String::new(),
    }
}

fn media_listener(media_id: u16) -> String {
    format!("media:{}", media_id)
}

fn listener_media_id(listener_id: &str) -> Option<u16> {
    listener_id.strip_prefix("media:")?.parse().ok()
}
