use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, trace, warn};

use super::{
    CloseReason, SessionConfig, SessionError, SessionEvent, SessionResult, SessionStatus,
    UdpPacket,
};
use crate::flows::{Flow, RttEstimator, Writer};
use crate::handshake::{EstablishedSession, HandshakeRole, PEER_ID_SIZE};
use crate::messages::{ChunkReader, SessionChunk};
use crate::packet_io::{
    decode, encode, init_packet, init_packet_with_echo, RtmfpCipher, MARKER_AMF, MARKER_RAW,
    MAX_PACKET_SIZE,
};
use crate::time::RtmfpTimestamp;

// Chunk bytes that fit one datagram after the fixed header
const PACKET_CHUNK_BUDGET: usize = MAX_PACKET_SIZE - 11;

// An echo time older than this is not representable in the 16 bit field
const MAX_ECHO_DELAY_MS: u64 = 262_140;

/// A session that represents one encrypted RTMFP conversation with a far peer.
///
/// The `RtmfpSession` does not care how datagrams come in or get sent out, but leaves that
/// up to the engine embedding it.  It demultiplexes the chunks of every datagram into its
/// flows and writers, generates acknowledgements, runs the keep-alive ladder and hands
/// reassembled messages upward as events.
pub struct RtmfpSession {
    local_id: u32,
    far_id: u32,
    peer_address: SocketAddr,
    send_cipher: RtmfpCipher,
    recv_cipher: RtmfpCipher,
    status: SessionStatus,
    role: HandshakeRole,
    far_peer_id: Option<[u8; PEER_ID_SIZE]>,
    writers: BTreeMap<u64, Writer>,
    flows: BTreeMap<u64, Flow>,
    next_writer_id: u64,
    rtt: RttEstimator,
    config: SessionConfig,
    started: Instant,
    last_reception: Instant,
    last_keepalive_sent: Option<Instant>,
    last_received_time: Option<RtmfpTimestamp>,
}

impl RtmfpSession {
    /// Creates a session from the keys and identifiers a completed handshake produced
    pub fn new(
        established: EstablishedSession,
        config: SessionConfig,
        now: Instant,
    ) -> Result<RtmfpSession, SessionError> {
        let send_cipher = RtmfpCipher::new(&established.send_key)?;
        let recv_cipher = RtmfpCipher::new(&established.recv_key)?;

        debug!(
            local_id = established.local_id,
            far_id = established.far_id,
            "New session"
        );

        Ok(RtmfpSession {
            local_id: established.local_id,
            far_id: established.far_id,
            peer_address: established.peer_address,
            send_cipher,
            recv_cipher,
            status: SessionStatus::Connected,
            role: established.role,
            far_peer_id: established.far_peer_id,
            writers: BTreeMap::new(),
            flows: BTreeMap::new(),
            next_writer_id: 2,
            rtt: RttEstimator::new(),
            config,
            started: now,
            last_reception: now,
            last_keepalive_sent: None,
            last_received_time: None,
        })
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn far_id(&self) -> u32 {
        self.far_id
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn far_peer_id(&self) -> Option<[u8; PEER_ID_SIZE]> {
        self.far_peer_id
    }

    pub fn smoothed_rtt(&self) -> Option<std::time::Duration> {
        self.rtt.smoothed()
    }

    /// Creates a new writer on this session.  The first writer of a connection gets id 2,
    /// the id the far peer expects the main command flow under.
    pub fn create_writer(&mut self, signature: Vec<u8>, flow_ref: Option<u64>) -> u64 {
        let id = self.next_writer_id;
        self.next_writer_id += 1;
        self.writers.insert(id, Writer::new(id, signature, flow_ref));
        id
    }

    /// Queues a message on one of this session's writers
    pub fn write_message(
        &mut self,
        writer_id: u64,
        payload: Bytes,
        reliable: bool,
    ) -> Result<(), SessionError> {
        match self.writers.get_mut(&writer_id) {
            Some(writer) => {
                writer.write_message(payload, reliable);
                Ok(())
            }
            None => Err(SessionError::UnknownWriter { writer_id }),
        }
    }

    /// Requests an orderly close of one writer; it survives until its end marker is acked
    pub fn close_writer(&mut self, writer_id: u64) {
        if let Some(writer) = self.writers.get_mut(&writer_id) {
            writer.close();
        }
    }

    pub fn writer_exists(&self, writer_id: u64) -> bool {
        self.writers.contains_key(&writer_id)
    }

    /// Takes in one raw datagram addressed to this session and returns any responses or
    /// events that can be reacted to.  Undecodable datagrams are dropped silently.
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Vec<SessionResult>, SessionError> {
        if self.status == SessionStatus::Closed || self.status == SessionStatus::Failed {
            return Ok(Vec::new());
        }

        let decoded = match decode(&self.recv_cipher, datagram) {
            Ok(x) => x,
            Err(error) => {
                trace!(%error, "Dropping undecodable datagram");
                return Ok(Vec::new());
            }
        };

        self.last_reception = now;
        self.last_received_time = Some(decoded.time);

        if let Some(echo) = decoded.echo_time {
            let delay_ticks = (self.wire_time(now) - echo).value;
            let delay_ms = delay_ticks as u64 * crate::time::TIMESTAMP_SCALE;
            if delay_ms < MAX_ECHO_DELAY_MS {
                self.rtt.add_sample(std::time::Duration::from_millis(delay_ms));
            }
        }

        let mut results = Vec::new();
        let mut replies: Vec<SessionChunk> = Vec::new();
        let mut advanced_flows: BTreeSet<u64> = BTreeSet::new();
        let mut last_flow: Option<(u64, u64)> = None;

        let mut reader = ChunkReader::new(&decoded.chunks);
        loop {
            let (type_id, payload) = match reader.next_chunk() {
                Ok(Some(x)) => x,
                Ok(None) => break,
                Err(error) => {
                    // A malformed chunk is a protocol violation; close the session
                    warn!(%error, "Protocol violation, closing the session");
                    results.append(&mut self.start_close(CloseReason::OtherException, now)?);
                    return Ok(results);
                }
            };

            let chunk = match SessionChunk::parse(type_id, payload) {
                Ok(x) => x,
                Err(error) => {
                    warn!(%error, "Protocol violation, closing the session");
                    results.append(&mut self.start_close(CloseReason::OtherException, now)?);
                    return Ok(results);
                }
            };

            match chunk {
                SessionChunk::SessionFailed => {
                    let closing_ourselves = self.status == SessionStatus::NearClosed;
                    self.free(if closing_ourselves {
                        SessionStatus::Closed
                    } else {
                        SessionStatus::Failed
                    });

                    results.push(SessionResult::RaisedEvent(if closing_ourselves {
                        SessionEvent::SessionClosed {
                            reason: CloseReason::SessionClosed,
                        }
                    } else {
                        SessionEvent::SessionFailed {
                            description: "Session failed by the far peer".to_string(),
                        }
                    }));
                    return Ok(results);
                }

                SessionChunk::CloseRequest { reason } => {
                    replies.push(SessionChunk::SessionFailed);
                    let reason = CloseReason::from_u8(reason);
                    self.free(SessionStatus::Closed);
                    results.push(SessionResult::RaisedEvent(SessionEvent::SessionClosed {
                        reason,
                    }));
                    // Answer the close before going quiet
                    if let Some(packet) = self.seal_chunks(&replies, MARKER_RAW, now)? {
                        results.push(SessionResult::OutboundPacket(packet));
                    }
                    return Ok(results);
                }

                SessionChunk::Ping => replies.push(SessionChunk::PingReply),
                SessionChunk::PingReply => trace!("Ping reply received"),
                SessionChunk::Keepalive => replies.push(SessionChunk::KeepaliveReply),
                SessionChunk::KeepaliveReply => trace!("Keepalive reply received"),

                SessionChunk::P2pAddresses { payload } => {
                    results.push(SessionResult::RaisedEvent(
                        SessionEvent::P2pAddressExchange { payload },
                    ));
                }

                SessionChunk::WriterException { flow_id, reason } => {
                    debug!(writer = flow_id, reason, "Writer closed by the far peer");
                    if let Some(writer) = self.writers.get_mut(&flow_id) {
                        writer.fail();
                        self.writers.remove(&flow_id);
                        results.push(SessionResult::RaisedEvent(SessionEvent::WriterFailed {
                            writer_id: flow_id,
                        }));
                    }
                }

                SessionChunk::FlowData(data) => {
                    last_flow = Some((data.flow_id, data.stage));
                    advanced_flows.insert(data.flow_id);
                    self.input_fragment(
                        data.flow_id,
                        data.stage,
                        data.flags,
                        data.signature,
                        data.writer_ref,
                        data.payload,
                        now,
                        &mut results,
                    );
                }

                SessionChunk::FlowContinuation { flags, payload } => {
                    match last_flow {
                        Some((flow_id, stage)) => {
                            let next_stage = stage + 1;
                            last_flow = Some((flow_id, next_stage));
                            advanced_flows.insert(flow_id);
                            self.input_fragment(
                                flow_id, next_stage, flags, None, None, payload, now,
                                &mut results,
                            );
                        }
                        None => {
                            warn!("Flow continuation without a flow, closing the session");
                            results
                                .append(&mut self.start_close(CloseReason::OtherException, now)?);
                            return Ok(results);
                        }
                    }
                }

                SessionChunk::Ack(ack) => {
                    if let Some(writer) = self.writers.get_mut(&ack.flow_id) {
                        writer.handle_ack(&ack, now);
                        if writer.is_finished() {
                            debug!(writer = ack.flow_id, "Writer consumed");
                            self.writers.remove(&ack.flow_id);
                        }
                    }
                }

                SessionChunk::Nack(nack) => {
                    if let Some(writer) = self.writers.get_mut(&nack.flow_id) {
                        writer.handle_nack(&nack, now);
                    }
                }

                SessionChunk::Unknown { type_id, .. } => {
                    warn!(type_id, "Unknown chunk type, closing the session");
                    results.append(&mut self.start_close(CloseReason::OtherException, now)?);
                    return Ok(results);
                }
            }
        }

        // One acknowledgement per flow that received chunks in this datagram
        for flow_id in advanced_flows {
            if let Some(flow) = self.flows.get_mut(&flow_id) {
                replies.push(SessionChunk::Ack(flow.build_ack(now)));
            }
        }

        if !replies.is_empty() {
            if let Some(packet) = self.seal_chunks(&replies, MARKER_RAW, now)? {
                results.push(SessionResult::OutboundPacket(packet));
            }
        }

        Ok(results)
    }

    /// Serializes pending writer traffic into as many datagrams as needed
    pub fn flush(&mut self, now: Instant) -> Result<Vec<SessionResult>, SessionError> {
        let mut results = Vec::new();
        if self.status != SessionStatus::Connected && self.status != SessionStatus::NearClosed {
            return Ok(results);
        }

        let rto = self.rtt.rto();
        let writer_ids: Vec<u64> = self.writers.keys().copied().collect();

        let mut chunks: Vec<SessionChunk> = Vec::new();
        let mut available = PACKET_CHUNK_BUDGET;

        for writer_id in writer_ids {
            loop {
                let writer = match self.writers.get_mut(&writer_id) {
                    Some(x) => x,
                    None => break,
                };
                if !writer.has_pending(now) {
                    break;
                }

                let batch = writer.next_chunks(&mut available, now, rto);
                if batch.is_empty() {
                    // The next fragment does not fit; seal this packet and start a new one
                    if chunks.is_empty() {
                        break;
                    }

                    if let Some(packet) = self.seal_chunks(&chunks, MARKER_AMF, now)? {
                        results.push(SessionResult::OutboundPacket(packet));
                    }
                    chunks.clear();
                    available = PACKET_CHUNK_BUDGET;
                    continue;
                }

                chunks.extend(batch.into_iter().map(SessionChunk::FlowData));
            }
        }

        if !chunks.is_empty() {
            if let Some(packet) = self.seal_chunks(&chunks, MARKER_AMF, now)? {
                results.push(SessionResult::OutboundPacket(packet));
            }
        }

        Ok(results)
    }

    /// Runs the periodic work of the session: the keep-alive ladder, retransmission timers
    /// and flow pruning
    pub fn manage(&mut self, now: Instant) -> Result<Vec<SessionResult>, SessionError> {
        if self.status == SessionStatus::Closed || self.status == SessionStatus::Failed {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        let silence = now.duration_since(self.last_reception);

        if silence >= self.config.close_timeout {
            warn!(local_id = self.local_id, "Session timed out, freeing it");
            self.free(SessionStatus::Failed);
            results.push(SessionResult::RaisedEvent(SessionEvent::SessionFailed {
                description: CloseReason::KeepaliveAttempt.description().to_string(),
            }));
            return Ok(results);
        }

        if self.status == SessionStatus::Connected {
            if silence >= self.config.keepalive * 2 {
                debug!(local_id = self.local_id, "Still silent, requesting a close");
                self.status = SessionStatus::NearClosed;
                let chunks = [SessionChunk::CloseRequest {
                    reason: CloseReason::KeepaliveAttempt.to_u8(),
                }];
                if let Some(packet) = self.seal_chunks(&chunks, MARKER_RAW, now)? {
                    results.push(SessionResult::OutboundPacket(packet));
                }
            } else if silence >= self.config.keepalive && self.keepalive_due() {
                trace!(local_id = self.local_id, "Probing a silent peer");
                self.last_keepalive_sent = Some(now);
                let chunks = [SessionChunk::Keepalive];
                if let Some(packet) = self.seal_chunks(&chunks, MARKER_RAW, now)? {
                    results.push(SessionResult::OutboundPacket(packet));
                }
            }
        }

        // Retransmission timers live inside the writers; flushing services them
        results.append(&mut self.flush(now)?);

        let prunable: Vec<u64> = self
            .flows
            .iter()
            .filter(|(_, flow)| flow.can_be_pruned(now))
            .map(|(id, _)| *id)
            .collect();
        for flow_id in prunable {
            debug!(flow = flow_id, "Flow consumed");
            self.flows.remove(&flow_id);
        }

        Ok(results)
    }

    /// Starts an orderly session close: every writer flushes its end marker best effort and
    /// a close request is sent to the peer
    pub fn close(
        &mut self,
        reason: CloseReason,
        now: Instant,
    ) -> Result<Vec<SessionResult>, SessionError> {
        self.start_close(reason, now)
    }

    fn start_close(
        &mut self,
        reason: CloseReason,
        now: Instant,
    ) -> Result<Vec<SessionResult>, SessionError> {
        if self.status != SessionStatus::Connected {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        let writer_ids: Vec<u64> = self.writers.keys().copied().collect();
        for writer_id in writer_ids {
            self.close_writer(writer_id);
        }
        results.append(&mut self.flush(now)?);

        self.status = SessionStatus::NearClosed;
        let chunks = [SessionChunk::CloseRequest {
            reason: reason.to_u8(),
        }];
        if let Some(packet) = self.seal_chunks(&chunks, MARKER_RAW, now)? {
            results.push(SessionResult::OutboundPacket(packet));
        }

        Ok(results)
    }

    #[allow(clippy::too_many_arguments)]
    fn input_fragment(
        &mut self,
        flow_id: u64,
        stage: u64,
        flags: u8,
        signature: Option<Vec<u8>>,
        writer_ref: Option<u64>,
        payload: Bytes,
        now: Instant,
        results: &mut Vec<SessionResult>,
    ) {
        let flow = self.flows.entry(flow_id).or_insert_with(|| {
            Flow::new(
                flow_id,
                signature.unwrap_or_default(),
                writer_ref.unwrap_or(0),
            )
        });

        let input = flow.input(stage, flags, payload, now);
        let flow_signature = flow.signature.clone();
        let writer_ref = flow.writer_ref;
        let lost_bytes = flow.lost_bytes();
        let ended = input.ended;

        for message in input.messages {
            results.push(SessionResult::RaisedEvent(SessionEvent::MessageReceived {
                flow_id,
                writer_ref,
                signature: flow_signature.clone(),
                payload: message,
                lost_bytes,
            }));
        }

        if ended {
            results.push(SessionResult::RaisedEvent(SessionEvent::FlowEnded {
                flow_id,
                signature: flow_signature,
            }));
        }
    }

    fn seal_chunks(
        &self,
        chunks: &[SessionChunk],
        marker: u8,
        now: Instant,
    ) -> Result<Option<UdpPacket>, SessionError> {
        if chunks.is_empty() {
            return Ok(None);
        }

        let time = self.wire_time(now);
        let mut packet = match self.last_received_time {
            Some(received) => {
                let held = now.duration_since(self.last_reception).as_millis() as u64;
                if held < MAX_ECHO_DELAY_MS {
                    let echo = received + RtmfpTimestamp::from_millis(held).value;
                    init_packet_with_echo(marker, time, echo)
                } else {
                    init_packet(marker, time)
                }
            }
            None => init_packet(marker, time),
        };

        for chunk in chunks {
            chunk.write(&mut packet)?;
        }

        let bytes = encode(&self.send_cipher, self.far_id, packet)?;
        Ok(Some(UdpPacket {
            to: self.peer_address,
            bytes,
        }))
    }

    fn keepalive_due(&self) -> bool {
        match self.last_keepalive_sent {
            None => true,
            Some(sent) => sent <= self.last_reception,
        }
    }

    fn free(&mut self, status: SessionStatus) {
        self.status = status;
        self.writers.clear();
        self.flows.clear();
    }

    fn wire_time(&self, now: Instant) -> RtmfpTimestamp {
        RtmfpTimestamp::from_millis(now.duration_since(self.started).as_millis() as u64)
    }
}
