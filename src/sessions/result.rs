use std::net::SocketAddr;

use super::events::SessionEvent;

/// A sealed datagram slated to be sent to a peer address.  Datagrams must be sent in the
/// order they are produced; the protocol tolerates losing them but not reordering whole
/// handshakes behind data.
#[derive(Debug, PartialEq)]
pub struct UdpPacket {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

/// A single result that is returned when the session reacts to packets or timers
#[derive(Debug, PartialEq)]
pub enum SessionResult {
    /// A datagram that should be handed to the UDP socket
    OutboundPacket(UdpPacket),

    /// An event the session is raising so the engine can perform custom logic
    RaisedEvent(SessionEvent),
}
