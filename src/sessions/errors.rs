use thiserror::Error;

use crate::messages::{MessageDeserializationError, MessageSerializationError};
use crate::packet_io::PacketEncodeError;

/// An enumeration defining all the possible errors that a session can encounter while
/// processing inbound packets or producing outbound ones.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Encountered when an error occurs while parsing the chunks of an inbound packet.
    /// This is a protocol violation and closes the session.
    #[error("An error occurred deserializing incoming chunks: {0}")]
    ChunkDeserializationError(#[from] MessageDeserializationError),

    /// Encountered when an error occurs while serializing outbound chunks
    #[error("An error occurred serializing outbound chunks: {0}")]
    ChunkSerializationError(#[from] MessageSerializationError),

    /// Encountered when an outbound datagram could not be sealed
    #[error("An error occurred encoding an outbound datagram: {0}")]
    PacketEncodeError(#[from] PacketEncodeError),

    /// Encountered when a message is written to a writer id this session does not own
    #[error("No writer with id {writer_id} exists on this session")]
    UnknownWriter { writer_id: u64 },
}
