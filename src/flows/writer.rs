use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::messages::{
    Ack, FlowData, Nack, MESSAGE_ABANDON, MESSAGE_END, MESSAGE_OPTIONS, MESSAGE_RELIABLE,
    MESSAGE_WITH_AFTERPART, MESSAGE_WITH_BEFOREPART,
};

/// Largest payload a single flow fragment may carry; longer messages are split into
/// before/after parts that reassemble on the receiving side
pub const MESSAGE_SPLIT_SIZE: usize = 1152;

const MIN_RTO: Duration = Duration::from_millis(250);
const MAX_RTO: Duration = Duration::from_secs(10);

/// Exponentially weighted round trip estimator feeding writer retransmission timers.
/// Samples come from echoed packet times and keep-alive round trips.
pub struct RttEstimator {
    smoothed: Option<Duration>,
}

impl RttEstimator {
    pub fn new() -> RttEstimator {
        RttEstimator { smoothed: None }
    }

    pub fn add_sample(&mut self, sample: Duration) {
        self.smoothed = Some(match self.smoothed {
            None => sample,
            Some(current) => (current * 7 + sample) / 8,
        });
    }

    pub fn smoothed(&self) -> Option<Duration> {
        self.smoothed
    }

    /// The retransmission timeout: twice the smoothed round trip, clamped to sane bounds
    pub fn rto(&self) -> Duration {
        match self.smoothed {
            None => Duration::from_secs(1),
            Some(current) => (current * 2).clamp(MIN_RTO, MAX_RTO),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum WriterState {
    Open,
    Closing,
    Closed,
}

struct QueuedFragment {
    flags: u8,
    payload: Bytes,
}

struct InFlightFragment {
    flags: u8,
    payload: Bytes,
    sent_at: Instant,
    retransmit_at: Instant,
    retries: u32,
}

/// The sending half of an RTMFP flow.
///
/// Messages are fragmented, assigned ascending stages as they ship, and kept in flight until
/// the peer acknowledges them.  Unreliable messages that outlive their usefulness are
/// replaced by an abandonment carrying the same stage, so the receiving flow can advance
/// without them.
pub struct Writer {
    pub id: u64,
    pub signature: Vec<u8>,

    /// The inbound flow this writer was opened in reply to, if any
    pub flow_ref: Option<u64>,

    send_stage: u64,
    ack_stage: u64,
    queue: VecDeque<QueuedFragment>,
    in_flight: BTreeMap<u64, InFlightFragment>,
    state: WriterState,
}

impl Writer {
    pub fn new(id: u64, signature: Vec<u8>, flow_ref: Option<u64>) -> Writer {
        debug!(writer = id, "New writer");
        Writer {
            id,
            signature,
            flow_ref,
            send_stage: 0,
            ack_stage: 0,
            queue: VecDeque::new(),
            in_flight: BTreeMap::new(),
            state: WriterState::Open,
        }
    }

    /// Queues one message, splitting it into fragments when it exceeds the fragment size.
    /// Reliable messages are retransmitted until acknowledged; unreliable ones are abandoned
    /// once their retransmission timer fires.
    pub fn write_message(&mut self, payload: Bytes, reliable: bool) {
        if self.state != WriterState::Open {
            trace!(writer = self.id, "Message dropped, the writer is closing");
            return;
        }

        let reliable_flag = if reliable { MESSAGE_RELIABLE } else { 0 };
        if payload.len() <= MESSAGE_SPLIT_SIZE {
            self.queue.push_back(QueuedFragment {
                flags: reliable_flag,
                payload,
            });
            return;
        }

        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + MESSAGE_SPLIT_SIZE).min(payload.len());
            let mut flags = reliable_flag;
            if offset > 0 {
                flags |= MESSAGE_WITH_BEFOREPART;
            }
            if end < payload.len() {
                flags |= MESSAGE_WITH_AFTERPART;
            }

            self.queue.push_back(QueuedFragment {
                flags,
                payload: payload.slice(offset..end),
            });
            offset = end;
        }
    }

    /// Requests an orderly close: an end marker ships after everything already queued, and
    /// the writer reports finished once the peer acknowledges all of it
    pub fn close(&mut self) {
        if self.state != WriterState::Open {
            return;
        }

        self.state = WriterState::Closing;
        self.queue.push_back(QueuedFragment {
            flags: MESSAGE_RELIABLE | MESSAGE_END | MESSAGE_ABANDON,
            payload: Bytes::new(),
        });
    }

    /// Drops the writer on the spot, in reaction to a writer exception from the peer
    pub fn fail(&mut self) {
        debug!(writer = self.id, "Writer failed");
        self.queue.clear();
        self.in_flight.clear();
        self.state = WriterState::Closed;
    }

    /// True once a closing writer has nothing queued and nothing awaiting acknowledgement
    pub fn is_finished(&self) -> bool {
        match self.state {
            WriterState::Closed => true,
            WriterState::Closing => self.queue.is_empty() && self.in_flight.is_empty(),
            WriterState::Open => false,
        }
    }

    /// True when the writer has fragments ready to ship right now
    pub fn has_pending(&self, now: Instant) -> bool {
        if self.state == WriterState::Closed {
            return false;
        }

        !self.queue.is_empty()
            || self
                .in_flight
                .values()
                .any(|fragment| fragment.retransmit_at <= now)
    }

    /// Highest stage assigned so far
    pub fn send_stage(&self) -> u64 {
        self.send_stage
    }

    /// Stages currently awaiting acknowledgement
    pub fn in_flight_stages(&self) -> Vec<u64> {
        self.in_flight.keys().copied().collect()
    }

    /// Emits the next batch of flow data chunks that fit within `available` payload bytes.
    /// Retransmissions ship before new fragments so a stalled stage cannot be starved.
    pub fn next_chunks(&mut self, available: &mut usize, now: Instant, rto: Duration) -> Vec<FlowData> {
        let mut chunks = Vec::new();
        if self.state == WriterState::Closed {
            return chunks;
        }

        // Retransmissions first
        let due: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, fragment)| fragment.retransmit_at <= now)
            .map(|(stage, _)| *stage)
            .collect();

        for stage in due {
            let (flags, payload, retries) = {
                let fragment = self.in_flight.get_mut(&stage).expect("stage was just listed");
                let cost = fragment.payload.len() + self.signature.len() + 16;
                if cost > *available {
                    return chunks;
                }

                fragment.retries += 1;
                // An unreliable fragment that timed out is not worth carrying anymore;
                // ship an abandonment under the same stage instead
                if fragment.flags & MESSAGE_RELIABLE == 0 && fragment.retries > 1 {
                    debug!(writer = self.id, stage, "Abandoning an unreliable fragment");
                    fragment.flags = MESSAGE_ABANDON;
                    fragment.payload = Bytes::new();
                }

                fragment.retransmit_at =
                    now + rto * 2_u32.saturating_pow(fragment.retries.min(6));
                *available -= cost;
                (fragment.flags, fragment.payload.clone(), fragment.retries)
            };

            chunks.push(self.build_chunk(stage, flags, payload));
            trace!(writer = self.id, stage, retries, "Retransmitting stage");
        }

        // Then fresh fragments off the queue
        while let Some(front) = self.queue.front() {
            let cost = front.payload.len() + self.signature.len() + 16;
            if cost > *available {
                break;
            }

            let fragment = self.queue.pop_front().expect("front was just observed");
            self.send_stage += 1;
            let stage = self.send_stage;

            self.in_flight.insert(
                stage,
                InFlightFragment {
                    flags: fragment.flags,
                    payload: fragment.payload.clone(),
                    sent_at: now,
                    retransmit_at: now + rto,
                    retries: 0,
                },
            );

            *available -= cost;
            chunks.push(self.build_chunk(stage, fragment.flags, fragment.payload));
        }

        chunks
    }

    /// Applies a positive acknowledgement: the cumulative prefix and every buffered run are
    /// cleared from flight, and stages the peer reported missing are queued for resend.
    pub fn handle_ack(&mut self, ack: &Ack, now: Instant) {
        if ack.cumulative_ack > self.ack_stage {
            self.ack_stage = ack.cumulative_ack;
        }

        let cleared: Vec<u64> = self
            .in_flight
            .keys()
            .copied()
            .filter(|stage| *stage <= ack.cumulative_ack)
            .collect();
        for stage in cleared {
            self.in_flight.remove(&stage);
        }

        let mut cursor = ack.cumulative_ack;
        for (lost, run) in &ack.ranges {
            let missing_count = lost + 1;
            let run_length = run + 1;

            // The peer is still waiting for these; resend without waiting for the timer
            for stage in (cursor + 1)..=(cursor + missing_count) {
                if let Some(fragment) = self.in_flight.get_mut(&stage) {
                    fragment.retransmit_at = now;
                }
            }

            cursor += missing_count;
            for stage in (cursor + 1)..=(cursor + run_length) {
                self.in_flight.remove(&stage);
            }
            cursor += run_length;
        }
    }

    /// Applies a negative acknowledgement: every reported range retransmits immediately
    pub fn handle_nack(&mut self, nack: &Nack, now: Instant) {
        for (first, last) in &nack.ranges {
            for stage in *first..=*last {
                if let Some(fragment) = self.in_flight.get_mut(&stage) {
                    fragment.retransmit_at = now;
                    trace!(writer = self.id, stage, "Stage reported missing, queued for resend");
                }
            }
        }
    }

    /// Age of the oldest unacknowledged fragment, used for congestion decisions
    pub fn oldest_in_flight_age(&self, now: Instant) -> Option<Duration> {
        self.in_flight
            .values()
            .map(|fragment| now.duration_since(fragment.sent_at))
            .max()
    }

    fn build_chunk(&self, stage: u64, flags: u8, payload: Bytes) -> FlowData {
        let opening = stage == 1;
        FlowData {
            flags: if opening { flags | MESSAGE_OPTIONS } else { flags },
            flow_id: self.id,
            stage,
            delta_ack: stage.saturating_sub(self.ack_stage),
            signature: if opening { Some(self.signature.clone()) } else { None },
            writer_ref: if opening { self.flow_ref } else { None },
            payload,
        }
    }
}
