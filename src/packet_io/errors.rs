use std::io;
use thiserror::Error;

/// An enumeration defining all the possible errors that could occur while decoding an
/// incoming RTMFP datagram.  All of these cause the datagram to be dropped silently.
#[derive(Debug, Error)]
pub enum PacketDecodeError {
    /// The datagram is too small to hold the session id, checksum and packet header
    #[error("The datagram is {size} bytes long, which is below the minimal RTMFP packet size of 12 bytes")]
    ShortPacket { size: usize },

    /// The encrypted portion of an RTMFP datagram is always a whole number of AES blocks
    #[error("The encrypted portion of the datagram is {size} bytes, which is not a multiple of the AES block size")]
    NotBlockAligned { size: usize },

    /// The plaintext checksum did not match the decrypted contents, either because the
    /// datagram was corrupted or because it was encrypted with a different key
    #[error("The datagram checksum did not match its decrypted contents")]
    BadCrc,
}

/// An enumeration defining all the possible errors that could occur while encoding an
/// outbound RTMFP datagram.
#[derive(Debug, Error)]
pub enum PacketEncodeError {
    /// Cipher keys are always exactly 16 bytes
    #[error("A cipher key of {size} bytes was provided, but RTMFP keys are exactly 16 bytes")]
    InvalidKeyLength { size: usize },

    /// An I/O error occurred while writing the output buffer
    #[error("{0}")]
    Io(#[from] io::Error),
}
