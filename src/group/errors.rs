use std::io;
use thiserror::Error;

/// An enumeration defining all the possible errors that could occur while parsing group
/// layer messages exchanged between NetGroup peers.
#[derive(Debug, Error)]
pub enum GroupMessageError {
    /// A group message ended before all of its announced fields could be read
    #[error("A group message was truncated: {0}")]
    Io(#[from] io::Error),

    /// A group message arrived with a marker this engine does not know
    #[error("Unknown group message marker 0x{marker:02X}")]
    UnknownMarker { marker: u8 },

    /// A group message carried a field with an impossible size
    #[error("A group message carried a malformed field")]
    MalformedMessage,
}
