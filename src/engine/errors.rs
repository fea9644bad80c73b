use thiserror::Error;

use crate::flash::FlashMessageError;
use crate::handshake::HandshakeError;
use crate::publisher::PublisherError;
use crate::sessions::SessionError;

/// An enumeration defining all the possible errors that could occur while driving the
/// engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An error bubbled up from one of the sessions
    #[error("A session error occurred: {0}")]
    SessionError(#[from] SessionError),

    /// An error bubbled up from the handshaker
    #[error("A handshake error occurred: {0}")]
    HandshakeError(#[from] HandshakeError),

    /// An error occurred while building or reading command traffic
    #[error("A command error occurred: {0}")]
    FlashMessageError(#[from] FlashMessageError),

    /// An error occurred while managing the publication
    #[error("A publication error occurred: {0}")]
    PublisherError(#[from] PublisherError),

    /// The operation needs a connected server session
    #[error("The operation requires a connected session")]
    NotConnected,

    /// A second connect was attempted while one is in progress or established
    #[error("A connection is already in progress or established")]
    AlreadyConnected,

    /// The operation references a stream this engine does not know
    #[error("No stream with media id {media_id} exists")]
    UnknownStream { media_id: u16 },

    /// The operation needs a joined NetGroup
    #[error("The operation requires a joined NetGroup")]
    NoGroup,

    /// The operation needs a running publication
    #[error("The operation requires a running publication")]
    NoPublication,

    /// A supplied peer id was not 64 hex characters
    #[error("The peer id {peer_id} is not a 64 character hex string")]
    InvalidPeerId { peer_id: String },
}
