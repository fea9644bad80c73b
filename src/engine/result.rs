use super::events::EngineEvent;
use crate::sessions::UdpPacket;

/// A single result that is returned when the engine reacts to datagrams, timers or public
/// operations.  Outbound packets must reach the socket in order; events may be handed to
/// whatever lane the application runs callbacks on.
#[derive(Debug)]
pub enum EngineResult {
    /// A sealed datagram to hand to the UDP socket
    OutboundPacket(UdpPacket),

    /// An event the application can perform custom logic on
    RaisedEvent(EngineEvent),
}
