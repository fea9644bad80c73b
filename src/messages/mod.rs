//! The chunk layer of RTMFP packets.
//!
//! After decryption a packet is a sequence of chunks, each `type(u8) length(u16) payload`,
//! terminated by the end-of-packet type or by 0xFF padding.  This module defines the chunk
//! inventory a session understands, the flow data and acknowledgement bodies, and the 7-bit
//! varint and socket address primitives shared by the handshake and group layers.

mod address;
mod errors;
mod varint;

pub use self::address::{read_address, write_address, AddressType};
pub use self::errors::{MessageDeserializationError, MessageSerializationError};
pub use self::varint::{read_u64_7bit, size_of_7bit, write_u64_7bit};

use byteorder::{ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Read, Write};

pub const CHUNK_END_OF_PACKET: u8 = 0x01;
pub const CHUNK_SESSION_FAILED: u8 = 0x0C;
pub const CHUNK_P2P_ADDRESSES: u8 = 0x0F;
pub const CHUNK_FLOW_DATA: u8 = 0x10;
pub const CHUNK_FLOW_CONTINUATION: u8 = 0x11;
pub const CHUNK_PING: u8 = 0x18;
pub const CHUNK_PING_REPLY: u8 = 0x19;
pub const CHUNK_KEEPALIVE_REPLY: u8 = 0x41;
pub const CHUNK_CLOSE_REQUEST: u8 = 0x4C;
pub const CHUNK_ACK: u8 = 0x50;
pub const CHUNK_KEEPALIVE: u8 = 0x51;
pub const CHUNK_NACK: u8 = 0x53;
pub const CHUNK_WRITER_EXCEPTION: u8 = 0x5E;

/// Flow message flags carried by flow data chunks
pub const MESSAGE_OPTIONS: u8 = 0x80;
pub const MESSAGE_WITH_BEFOREPART: u8 = 0x20;
pub const MESSAGE_WITH_AFTERPART: u8 = 0x10;
/// Local bookkeeping flag only, never serialized
pub const MESSAGE_RELIABLE: u8 = 0x04;
pub const MESSAGE_ABANDON: u8 = 0x02;
pub const MESSAGE_END: u8 = 0x01;

const OPTION_WRITER_REF: u8 = 0x0A;

/// Iterates over the `type length payload` chunks of a decoded packet.  Iteration stops at
/// the end-of-packet chunk, at 0xFF padding or when the bytes run out.
pub struct ChunkReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ChunkReader<'a> {
    pub fn new(data: &'a [u8]) -> ChunkReader<'a> {
        ChunkReader { data, position: 0 }
    }

    pub fn next_chunk(&mut self) -> Result<Option<(u8, &'a [u8])>, MessageDeserializationError> {
        if self.position >= self.data.len() {
            return Ok(None);
        }

        let type_id = self.data[self.position];
        if type_id == CHUNK_END_OF_PACKET || type_id == 0xFF || type_id == 0x00 {
            return Ok(None);
        }

        if self.position + 3 > self.data.len() {
            return Err(MessageDeserializationError::ChunkTooLong {
                type_id,
                declared: 2,
                remaining: self.data.len() - self.position - 1,
            });
        }

        let length = u16::from_be_bytes([
            self.data[self.position + 1],
            self.data[self.position + 2],
        ]) as usize;

        let start = self.position + 3;
        if start + length > self.data.len() {
            return Err(MessageDeserializationError::ChunkTooLong {
                type_id,
                declared: length,
                remaining: self.data.len() - start,
            });
        }

        self.position = start + length;
        Ok(Some((type_id, &self.data[start..start + length])))
    }
}

/// Appends a `type length payload` chunk to an outbound packet buffer
pub fn write_chunk(
    packet: &mut Vec<u8>,
    type_id: u8,
    payload: &[u8],
) -> Result<(), MessageSerializationError> {
    if payload.len() > u16::max_value() as usize {
        return Err(MessageSerializationError::PayloadTooLong {
            size: payload.len(),
        });
    }

    packet.push(type_id);
    packet.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    packet.extend_from_slice(payload);
    Ok(())
}

/// A flow data chunk: one fragment of one flow message, optionally opening the flow with
/// its signature options when it carries stage 1.
#[derive(Debug, PartialEq, Clone)]
pub struct FlowData {
    pub flags: u8,
    pub flow_id: u64,
    pub stage: u64,
    pub delta_ack: u64,
    pub signature: Option<Vec<u8>>,
    pub writer_ref: Option<u64>,
    pub payload: Bytes,
}

/// A positive acknowledgement for one flow: everything up to `cumulative_ack` was delivered,
/// followed by `(lost count, buffered run)` pairs describing holes past it.
#[derive(Debug, PartialEq, Clone)]
pub struct Ack {
    pub flow_id: u64,
    pub buffer_available: u64,
    pub cumulative_ack: u64,
    pub ranges: Vec<(u64, u64)>,
}

/// A negative acknowledgement: inclusive stage ranges the peer reports missing
#[derive(Debug, PartialEq, Clone)]
pub struct Nack {
    pub flow_id: u64,
    pub ranges: Vec<(u64, u64)>,
}

/// Every chunk type a connected session knows how to react to
#[derive(Debug, PartialEq, Clone)]
pub enum SessionChunk {
    SessionFailed,
    P2pAddresses { payload: Vec<u8> },
    Ping,
    PingReply,
    Keepalive,
    KeepaliveReply,
    CloseRequest { reason: u8 },
    WriterException { flow_id: u64, reason: u8 },
    FlowData(FlowData),
    FlowContinuation { flags: u8, payload: Bytes },
    Ack(Ack),
    Nack(Nack),
    Unknown { type_id: u8, payload: Vec<u8> },
}

impl SessionChunk {
    /// Parses one chunk body according to its type id
    pub fn parse(type_id: u8, payload: &[u8]) -> Result<SessionChunk, MessageDeserializationError> {
        let chunk = match type_id {
            CHUNK_SESSION_FAILED => SessionChunk::SessionFailed,
            CHUNK_P2P_ADDRESSES => SessionChunk::P2pAddresses {
                payload: payload.to_vec(),
            },
            CHUNK_PING => SessionChunk::Ping,
            CHUNK_PING_REPLY => SessionChunk::PingReply,
            CHUNK_KEEPALIVE => SessionChunk::Keepalive,
            CHUNK_KEEPALIVE_REPLY => SessionChunk::KeepaliveReply,
            CHUNK_CLOSE_REQUEST => SessionChunk::CloseRequest {
                reason: payload.first().copied().unwrap_or(0),
            },
            CHUNK_WRITER_EXCEPTION => {
                let mut cursor = Cursor::new(payload);
                let flow_id = read_u64_7bit(&mut cursor)?;
                let reason = cursor.read_u8().unwrap_or(0);
                SessionChunk::WriterException { flow_id, reason }
            }
            CHUNK_FLOW_DATA => SessionChunk::FlowData(parse_flow_data(payload)?),
            CHUNK_FLOW_CONTINUATION => {
                let mut cursor = Cursor::new(payload);
                let flags = cursor.read_u8()?;
                let position = cursor.position() as usize;
                SessionChunk::FlowContinuation {
                    flags,
                    payload: Bytes::copy_from_slice(&payload[position..]),
                }
            }
            CHUNK_ACK => SessionChunk::Ack(parse_ack(payload)?),
            CHUNK_NACK => SessionChunk::Nack(parse_nack(payload)?),
            _ => SessionChunk::Unknown {
                type_id,
                payload: payload.to_vec(),
            },
        };

        Ok(chunk)
    }

    /// Serializes the chunk (type, length and body) into an outbound packet buffer
    pub fn write(&self, packet: &mut Vec<u8>) -> Result<(), MessageSerializationError> {
        match self {
            SessionChunk::SessionFailed => write_chunk(packet, CHUNK_SESSION_FAILED, &[]),
            SessionChunk::P2pAddresses { payload } => {
                write_chunk(packet, CHUNK_P2P_ADDRESSES, payload)
            }
            SessionChunk::Ping => write_chunk(packet, CHUNK_PING, &[]),
            SessionChunk::PingReply => write_chunk(packet, CHUNK_PING_REPLY, &[]),
            SessionChunk::Keepalive => write_chunk(packet, CHUNK_KEEPALIVE, &[]),
            SessionChunk::KeepaliveReply => write_chunk(packet, CHUNK_KEEPALIVE_REPLY, &[]),
            SessionChunk::CloseRequest { reason } => {
                write_chunk(packet, CHUNK_CLOSE_REQUEST, &[*reason])
            }
            SessionChunk::WriterException { flow_id, reason } => {
                let mut body = Vec::new();
                write_u64_7bit(&mut body, *flow_id)?;
                body.push(*reason);
                write_chunk(packet, CHUNK_WRITER_EXCEPTION, &body)
            }
            SessionChunk::FlowData(data) => {
                let mut body = Vec::with_capacity(data.payload.len() + 16);
                write_flow_data(&mut body, data)?;
                write_chunk(packet, CHUNK_FLOW_DATA, &body)
            }
            SessionChunk::FlowContinuation { flags, payload } => {
                let mut body = Vec::with_capacity(payload.len() + 1);
                body.push(*flags);
                body.extend_from_slice(payload);
                write_chunk(packet, CHUNK_FLOW_CONTINUATION, &body)
            }
            SessionChunk::Ack(ack) => {
                let mut body = Vec::new();
                write_u64_7bit(&mut body, ack.flow_id)?;
                write_u64_7bit(&mut body, ack.buffer_available)?;
                write_u64_7bit(&mut body, ack.cumulative_ack)?;
                for (lost, run) in &ack.ranges {
                    write_u64_7bit(&mut body, *lost)?;
                    write_u64_7bit(&mut body, *run)?;
                }
                write_chunk(packet, CHUNK_ACK, &body)
            }
            SessionChunk::Nack(nack) => {
                let mut body = Vec::new();
                write_u64_7bit(&mut body, nack.flow_id)?;
                for (first, last) in &nack.ranges {
                    write_u64_7bit(&mut body, *first)?;
                    write_u64_7bit(&mut body, *last)?;
                }
                write_chunk(packet, CHUNK_NACK, &body)
            }
            SessionChunk::Unknown { type_id, payload } => write_chunk(packet, *type_id, payload),
        }
    }
}

fn parse_flow_data(payload: &[u8]) -> Result<FlowData, MessageDeserializationError> {
    let mut cursor = Cursor::new(payload);
    let flags = cursor.read_u8()?;
    let flow_id = read_u64_7bit(&mut cursor)?;
    let stage = read_u64_7bit(&mut cursor)?;
    let delta_ack = read_u64_7bit(&mut cursor)?;

    let mut signature = None;
    let mut writer_ref = None;
    if flags & MESSAGE_OPTIONS != 0 {
        let signature_length = cursor.read_u8()? as usize;
        let mut bytes = vec![0_u8; signature_length];
        cursor.read_exact(&mut bytes)?;
        signature = Some(bytes);

        // Remaining options are length prefixed, a zero length ends the list
        loop {
            let option_length = cursor.read_u8()? as usize;
            if option_length == 0 {
                break;
            }

            let end = cursor.position() + option_length as u64;
            let option_type = cursor.read_u8()?;
            if option_type == OPTION_WRITER_REF {
                writer_ref = Some(read_u64_7bit(&mut cursor)?);
            }

            cursor.set_position(end);
        }
    }

    let position = cursor.position() as usize;
    Ok(FlowData {
        flags,
        flow_id,
        stage,
        delta_ack,
        signature,
        writer_ref,
        payload: Bytes::copy_from_slice(&payload[position..]),
    })
}

fn write_flow_data(body: &mut Vec<u8>, data: &FlowData) -> Result<(), MessageSerializationError> {
    // The reliable flag is local bookkeeping and never reaches the wire
    body.write_u8(data.flags & !MESSAGE_RELIABLE)?;
    write_u64_7bit(body, data.flow_id)?;
    write_u64_7bit(body, data.stage)?;
    write_u64_7bit(body, data.delta_ack)?;

    if data.flags & MESSAGE_OPTIONS != 0 {
        let signature = data.signature.as_deref().unwrap_or(&[]);
        body.write_u8(signature.len() as u8)?;
        body.write_all(signature)?;

        if let Some(writer_ref) = data.writer_ref {
            body.write_u8((1 + size_of_7bit(writer_ref)) as u8)?;
            body.write_u8(OPTION_WRITER_REF)?;
            write_u64_7bit(body, writer_ref)?;
        }

        body.write_u8(0)?;
    }

    body.write_all(&data.payload)?;
    Ok(())
}

fn parse_ack(payload: &[u8]) -> Result<Ack, MessageDeserializationError> {
    let mut cursor = Cursor::new(payload);
    let flow_id = read_u64_7bit(&mut cursor)?;
    let buffer_available = read_u64_7bit(&mut cursor)?;
    let cumulative_ack = read_u64_7bit(&mut cursor)?;

    let mut ranges = Vec::new();
    while (cursor.position() as usize) < payload.len() {
        let lost = read_u64_7bit(&mut cursor)?;
        let run = read_u64_7bit(&mut cursor)?;
        ranges.push((lost, run));
    }

    Ok(Ack {
        flow_id,
        buffer_available,
        cumulative_ack,
        ranges,
    })
}

fn parse_nack(payload: &[u8]) -> Result<Nack, MessageDeserializationError> {
    let mut cursor = Cursor::new(payload);
    let flow_id = read_u64_7bit(&mut cursor)?;

    let mut ranges = Vec::new();
    while (cursor.position() as usize) < payload.len() {
        let first = read_u64_7bit(&mut cursor)?;
        let last = read_u64_7bit(&mut cursor)?;
        ranges.push((first, last));
    }

    Ok(Nack { flow_id, ranges })
}
