use std::io;
use thiserror::Error;

use crate::messages::{MessageDeserializationError, MessageSerializationError};
use crate::packet_io::{PacketDecodeError, PacketEncodeError};

/// An enumeration defining all the possible errors that could occur while performing or
/// answering RTMFP handshakes.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// A handshake chunk body ended before all of its fields could be read
    #[error("A handshake chunk was truncated: {0}")]
    Io(#[from] io::Error),

    /// An address list inside a handshake chunk could not be parsed
    #[error("An address inside a handshake chunk could not be parsed: {0}")]
    BadAddress(#[from] MessageDeserializationError),

    /// A handshake chunk field declared an impossible length or marker
    #[error("A handshake chunk carried a malformed field")]
    MalformedPacket,

    /// The endpoint discriminator of a first round packet was neither a url nor a peer id
    #[error("The endpoint discriminator was neither an rtmfp url nor a peer id")]
    MalformedEpd,

    /// A second round packet referenced a cookie this handshaker never issued
    #[error("A handshake referenced an unknown or expired cookie")]
    UnknownCookie,

    /// A reply carried a tag that matches no handshake attempt in progress
    #[error("A handshake reply carried an unknown tag")]
    UnknownTag,

    /// The far peer announced a public key of an unusable size
    #[error("The far public key is {size} bytes, expected a 128 byte Diffie-Hellman key")]
    BadFarKeySize { size: usize },

    /// An error occurred while serializing an outbound handshake chunk
    #[error("An error occurred serializing an outbound handshake: {0}")]
    Serialization(#[from] MessageSerializationError),

    /// An error occurred while sealing an outbound handshake datagram
    #[error("An error occurred encoding an outbound handshake datagram: {0}")]
    PacketEncode(#[from] PacketEncodeError),

    /// An inbound handshake datagram could not be decoded
    #[error("An inbound handshake datagram could not be decoded: {0}")]
    PacketDecode(#[from] PacketDecodeError),
}
