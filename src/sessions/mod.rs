//! This module contains the session abstraction of the protocol engine.
//!
//! A session is the encrypted conversation with one far peer (the server or a p2p peer).
//! It reacts to decoded datagrams with packets to be sent back and with events the engine
//! can perform custom logic on; it never touches a socket itself.

mod config;
mod errors;
mod events;
mod result;
mod session;

pub use self::config::SessionConfig;
pub use self::errors::SessionError;
pub use self::events::SessionEvent;
pub use self::result::{SessionResult, UdpPacket};
pub use self::session::RtmfpSession;

/// Life cycle of a session.  The handshake states are carried by attempts still inside the
/// handshaker; a session object starts its life connected.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SessionStatus {
    Handshake30Sent,
    Handshake70Sent,
    Handshake38Sent,
    Handshake78Sent,
    Connected,
    NearClosed,
    Failed,
    Closed,
}

/// The single byte close reason carried by close requests and surfaced in status events
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CloseReason {
    SessionClosed,
    InputCongested,
    OutputCongested,
    KeepaliveAttempt,
    P2pEstablishment,
    P2pRate,
    OtherException,
    P2pPullTimeout,
}

impl CloseReason {
    pub fn from_u8(value: u8) -> CloseReason {
        match value {
            1 => CloseReason::InputCongested,
            2 => CloseReason::OutputCongested,
            3 => CloseReason::KeepaliveAttempt,
            4 => CloseReason::P2pEstablishment,
            5 => CloseReason::P2pRate,
            6 => CloseReason::OtherException,
            7 => CloseReason::P2pPullTimeout,
            _ => CloseReason::SessionClosed,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            CloseReason::SessionClosed => 0,
            CloseReason::InputCongested => 1,
            CloseReason::OutputCongested => 2,
            CloseReason::KeepaliveAttempt => 3,
            CloseReason::P2pEstablishment => 4,
            CloseReason::P2pRate => 5,
            CloseReason::OtherException => 6,
            CloseReason::P2pPullTimeout => 7,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            CloseReason::SessionClosed => "Session closed",
            CloseReason::InputCongested => "Input congested",
            CloseReason::OutputCongested => "Output congested",
            CloseReason::KeepaliveAttempt => "Keepalive attempt",
            CloseReason::P2pEstablishment => "P2P establishment error",
            CloseReason::P2pRate => "P2P low rate",
            CloseReason::OtherException => "Other exception",
            CloseReason::P2pPullTimeout => "Pull congestion timeout",
        }
    }
}
