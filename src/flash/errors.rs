use rml_amf0::{Amf0DeserializationError, Amf0SerializationError};
use std::io;
use thiserror::Error;

/// An enumeration defining all the possible errors that could occur while reading or
/// producing the AMF command traffic of a connection.
#[derive(Debug, Error)]
pub enum FlashMessageError {
    /// Encountered when an error occurs while deserializing incoming amf0 values
    #[error("An error occurred deserializing incoming amf0 values: {0}")]
    Amf0DeserializationError(#[from] Amf0DeserializationError),

    /// Encountered when an error occurs while serializing outbound amf0 values
    #[error("An error occurred serializing outbound amf0 values: {0}")]
    Amf0SerializationError(#[from] Amf0SerializationError),

    /// A message body ended before its header could be read
    #[error("A message body was truncated: {0}")]
    Io(#[from] io::Error),

    /// An invocation arrived without the command name and callback number every
    /// invocation starts with
    #[error("An invocation was missing its command name or callback number")]
    MalformedInvocation,

    /// A result arrived for a callback number no request is waiting on
    #[error("A result arrived for the unknown callback number {callback}")]
    UnknownCallback { callback: u64 },
}
