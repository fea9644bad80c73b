use bytes::Bytes;

use crate::sessions::CloseReason;

/// Events that can be raised by the engine so applications can perform custom logic.
/// Every failure surfaces here as a typed status event; nothing panics across the API.
#[derive(Debug, PartialEq)]
pub enum EngineEvent {
    /// A status change with its Flash-style code string, e.g. `NetConnection.Connect.Success`,
    /// `NetConnection.Connect.Failed`, `NetGroup.Connect.Failed`, `NetStream.Publish.Start`
    StatusEvent { code: String, description: String },

    /// A peer-to-peer session reached the connected state
    PeerConnected { peer_id: String },

    /// A peer-to-peer session went away
    PeerDisconnected { peer_id: String },

    /// A media frame arrived on one of the played streams
    MediaReceived {
        media_id: u16,
        type_id: u8,
        time: u32,
        payload: Bytes,
    },

    /// A media message left the group buffer in fragment order
    GroupMediaReceived {
        type_id: u8,
        time: u32,
        payload: Bytes,
    },

    /// The rendezvous service announced a group member worth connecting to
    GroupPeerDiscovered { peer_id: String },

    /// The server session closed
    SessionClosed { reason: CloseReason },

    /// The NetGroup went away, either on request or after a pull timeout
    GroupClosed { reason: CloseReason },
}
