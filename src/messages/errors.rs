use std::io;
use thiserror::Error;

/// An enumeration defining all the possible errors that could occur while parsing the chunks
/// of a decoded packet.  Most parse failures are protocol violations that close the session.
#[derive(Debug, Error)]
pub enum MessageDeserializationError {
    /// A chunk body ended before all of its announced fields could be read
    #[error("A chunk body was truncated: {0}")]
    Io(#[from] io::Error),

    /// A chunk declared a length that runs past the end of the packet
    #[error("A chunk of type 0x{type_id:02X} declares {declared} bytes but only {remaining} remain in the packet")]
    ChunkTooLong {
        type_id: u8,
        declared: usize,
        remaining: usize,
    },

    /// A flow continuation chunk (0x11) arrived without a preceding flow data chunk
    #[error("A flow continuation chunk arrived with no preceding flow data chunk in the packet")]
    OrphanContinuation,
}

/// An enumeration defining all the possible errors that could occur while serializing chunks
/// into an outbound packet.
#[derive(Debug, Error)]
pub enum MessageSerializationError {
    /// An I/O error occurred while writing the output buffer
    #[error("{0}")]
    Io(#[from] io::Error),

    /// Chunk payloads are length-prefixed with sixteen bits
    #[error("A chunk payload of {size} bytes exceeds the 65535 byte chunk limit")]
    PayloadTooLong { size: usize },
}
