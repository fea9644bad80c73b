use bytes::Bytes;

use super::CloseReason;

/// Events that can be raised by a session so the engine can perform custom logic
#[derive(Debug, PartialEq)]
pub enum SessionEvent {
    /// A complete flow message was reassembled and is ready for the layer above.  The
    /// signature is the one the flow opened with and decides who consumes the message.
    MessageReceived {
        flow_id: u64,
        writer_ref: u64,
        signature: Vec<u8>,
        payload: Bytes,
        lost_bytes: u64,
    },

    /// A flow delivered its final stage and is finished
    FlowEnded { flow_id: u64, signature: Vec<u8> },

    /// The far peer closed one of our writers; the rest of the session survives
    WriterFailed { writer_id: u64 },

    /// The far peer asked us to greet the listed addresses: a p2p handshake is incoming.
    /// The raw chunk payload is handed to the handshaker untouched.
    P2pAddressExchange { payload: Vec<u8> },

    /// The session closed in an orderly manner
    SessionClosed { reason: CloseReason },

    /// The session died: keep-alive budget exhausted, protocol violation or peer failure
    SessionFailed { description: String },
}
