//! Per-flow reliability: inbound reordering and reassembly, outbound fragmentation and
//! retransmission.
//!
//! A flow is a unidirectional ordered stream of stage-numbered fragments inside a session.
//! [`Flow`] is the receiving side: it delivers stages strictly in order, buffers the future,
//! drops the past and accounts for everything an abandonment skipped.  [`Writer`] is the
//! sending side: it fragments messages, keeps them in flight until acknowledged and decides
//! when an unreliable message stops being worth retransmitting.

mod flow;
mod writer;

pub use self::flow::{Flow, FlowInput};
pub use self::writer::{RttEstimator, Writer, MESSAGE_SPLIT_SIZE};
