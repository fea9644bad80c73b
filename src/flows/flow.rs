use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, trace};

use crate::messages::{Ack, MESSAGE_ABANDON, MESSAGE_END, MESSAGE_WITH_AFTERPART, MESSAGE_WITH_BEFOREPART};
use crate::packet_io::MAX_PACKET_SIZE;

// A skipped stage is charged at half a packet since its real size is unknown
const LOST_STAGE_ESTIMATE: u64 = (MAX_PACKET_SIZE / 2) as u64;

// The advertised reception window, in 1024 byte units
const BUFFER_AVAILABLE: u64 = 127;

struct BufferedFragment {
    flags: u8,
    payload: Bytes,
}

/// The outcome of feeding one fragment into a flow
#[derive(Debug, Default, PartialEq)]
pub struct FlowInput {
    /// Complete messages delivered by this fragment, in stage order
    pub messages: Vec<Bytes>,

    /// True once the final stage has been delivered and nothing is left buffered; the
    /// session should close the flow (and answer its writer) when it sees this
    pub ended: bool,
}

/// The receiving half of an RTMFP flow.
///
/// Stages are delivered strictly ascending from 1.  Fragments from the future are buffered,
/// fragments from the past are dropped, and abandonments jump the cursor forward while
/// charging everything skipped to `lost_bytes`.
pub struct Flow {
    pub id: u64,

    /// The writer the far peer opened this flow in reply to, zero for unsolicited flows
    pub writer_ref: u64,

    /// Signature carried by the flow's opening options, identifying what it transports
    pub signature: Vec<u8>,

    stage: u64,
    stage_end: Option<u64>,
    fragments: BTreeMap<u64, BufferedFragment>,
    reassembly: Option<Vec<u8>>,
    lost_bytes: u64,
    buffered_bytes: usize,
    completed_at: Option<Instant>,
}

impl Flow {
    pub fn new(id: u64, signature: Vec<u8>, writer_ref: u64) -> Flow {
        debug!(flow = id, "New flow");
        Flow {
            id,
            writer_ref,
            signature,
            stage: 0,
            stage_end: None,
            fragments: BTreeMap::new(),
            reassembly: None,
            lost_bytes: 0,
            buffered_bytes: 0,
            completed_at: None,
        }
    }

    /// Bytes charged to abandonments and undeliverable fragments so far
    pub fn lost_bytes(&self) -> u64 {
        self.lost_bytes
    }

    /// Bytes currently parked in the reorder buffer
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Highest stage handled so far; everything at or below it is delivered or abandoned
    pub fn current_stage(&self) -> u64 {
        self.stage
    }

    /// True once the flow has delivered its final stage
    pub fn is_ended(&self) -> bool {
        self.completed_at.is_some()
    }

    /// True when an ended flow has been quiet long enough to be pruned.  The grace period
    /// keeps the flow able to repeat acknowledgements the peer may have missed.
    pub fn can_be_pruned(&self, now: Instant) -> bool {
        match self.completed_at {
            Some(completed) => now.duration_since(completed).as_secs() >= 120,
            None => false,
        }
    }

    /// Feeds one received fragment into the flow
    pub fn input(&mut self, stage: u64, flags: u8, payload: Bytes, now: Instant) -> FlowInput {
        let mut result = FlowInput::default();

        if let Some(stage_end) = self.stage_end {
            if self.fragments.is_empty() && self.completed_at.is_some() {
                // Already complete; accept the stage anyway so acknowledgements repeat
                self.stage = self.stage.max(stage);
                return result;
            }
            if stage > stage_end {
                debug!(flow = self.id, stage, stage_end, "Stage beyond the end of the flow");
                return result;
            }
        } else if flags & MESSAGE_END != 0 {
            self.stage_end = Some(stage);
        }

        let mut next_stage = self.stage + 1;
        if stage < next_stage {
            trace!(flow = self.id, stage, "Stage already received");
            return result;
        }

        if flags & MESSAGE_ABANDON != 0 {
            // Estimate what the abandonment skipped; a terminal END carries no data loss
            let mut lost = 0_u64;
            if flags & MESSAGE_END == 0 {
                lost += (stage - next_stage + 1) * LOST_STAGE_ESTIMATE;
                lost += payload.len() as u64;
            }

            next_stage = stage + 1;
            let kept = self.fragments.split_off(&next_stage);
            for (_, dropped) in std::mem::replace(&mut self.fragments, kept) {
                lost += dropped.payload.len() as u64;
                self.buffered_bytes -= dropped.payload.len();
            }

            if let Some(buffer) = self.reassembly.take() {
                lost += buffer.len() as u64;
            }

            if lost > 0 {
                debug!(
                    flow = self.id,
                    from = self.stage + 1,
                    to = stage,
                    lost,
                    "Fragments lost on flow"
                );
                self.lost_bytes += lost;
            }

            self.stage = stage;
        } else if stage > next_stage {
            // Not the following stage, buffer it until the hole fills
            if self.fragments.is_empty() {
                trace!(flow = self.id, waiting = next_stage, "Waiting for a missing stage");
            }

            if !self.fragments.contains_key(&stage) {
                self.buffered_bytes += payload.len();
                self.fragments.insert(stage, BufferedFragment { flags, payload });
                if self.fragments.len() > 100 {
                    debug!(
                        flow = self.id,
                        buffered = self.fragments.len(),
                        "Fragment reorder buffer is growing"
                    );
                }
            } else {
                trace!(flow = self.id, stage, "Stage already buffered");
            }

            return result;
        } else {
            self.deliver_fragment(next_stage, flags, payload, &mut result);
            next_stage += 1;
        }

        // Drain the contiguous suffix that became deliverable
        loop {
            let buffered_stage = match self.fragments.keys().next() {
                Some(stage) => *stage,
                None => break,
            };
            if buffered_stage > next_stage {
                break;
            }

            let fragment = self
                .fragments
                .remove(&buffered_stage)
                .expect("stage was just observed");
            self.buffered_bytes -= fragment.payload.len();
            self.deliver_fragment(next_stage, fragment.flags, fragment.payload, &mut result);
            next_stage += 1;
        }

        if self.fragments.is_empty() && self.stage_end.is_some() && self.completed_at.is_none() {
            self.completed_at = Some(now);
            result.ended = true;
        }

        result
    }

    /// Builds the acknowledgement for this flow: the cumulative stage plus
    /// `(missing - 1, run - 1)` pairs describing each buffered island past it.
    pub fn build_ack(&mut self, now: Instant) -> Ack {
        let mut ranges = Vec::new();
        let mut previous = self.stage;

        let stages: Vec<u64> = self.fragments.keys().copied().collect();
        let mut index = 0;
        while index < stages.len() {
            let start = stages[index];
            let mut run = 1_u64;
            while index + 1 < stages.len() && stages[index + 1] == stages[index] + 1 {
                run += 1;
                index += 1;
            }
            index += 1;

            ranges.push((start - previous - 2, run - 1));
            previous = start + run - 1;
        }

        // Refresh the completion clock so an acked flow is not pruned under the peer
        if let Some(completed) = self.completed_at.as_mut() {
            *completed = now;
        }

        Ack {
            flow_id: self.id,
            buffer_available: BUFFER_AVAILABLE,
            cumulative_ack: self.stage,
            ranges,
        }
    }

    fn deliver_fragment(&mut self, stage: u64, flags: u8, payload: Bytes, result: &mut FlowInput) {
        self.stage = stage;

        if let Some(buffer) = self.reassembly.as_mut() {
            buffer.extend_from_slice(&payload);
            if flags & MESSAGE_WITH_AFTERPART != 0 {
                return;
            }

            let message = self.reassembly.take().unwrap_or_default();
            if !message.is_empty() {
                result.messages.push(Bytes::from(message));
            }
            return;
        }

        if flags & MESSAGE_WITH_BEFOREPART != 0 {
            // The beginning of this message was abandoned before we saw it
            debug!(flow = self.id, stage, "Fragment lost its beginning, dropped");
            self.lost_bytes += payload.len() as u64;
            return;
        }

        if flags & MESSAGE_WITH_AFTERPART != 0 {
            self.reassembly = Some(payload.to_vec());
            return;
        }

        if !payload.is_empty() {
            result.messages.push(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    #[test]
    fn stages_received_out_of_order_are_delivered_in_order() {
        let now = Instant::now();
        let mut flow = Flow::new(3, Vec::new(), 0);

        let first = flow.input(1, 0, payload("one"), now);
        assert_eq!(first.messages, vec![payload("one")]);

        let buffered = flow.input(3, 0, payload("three"), now);
        assert_eq!(buffered.messages.len(), 0, "Stage 3 must wait for stage 2");

        let drained = flow.input(2, 0, payload("two"), now);
        assert_eq!(
            drained.messages,
            vec![payload("two"), payload("three")],
            "Stages 2 and 3 should deliver together"
        );

        let last = flow.input(4, MESSAGE_END, payload("four"), now);
        assert_eq!(last.messages, vec![payload("four")]);
        assert!(last.ended, "Flow should end after its final stage");
        assert_eq!(flow.lost_bytes(), 0, "No bytes were lost");
    }

    #[test]
    fn duplicate_stages_are_dropped() {
        let now = Instant::now();
        let mut flow = Flow::new(3, Vec::new(), 0);

        flow.input(1, 0, payload("one"), now);
        let duplicate = flow.input(1, 0, payload("one"), now);

        assert_eq!(duplicate.messages.len(), 0, "Duplicate stage must not deliver");
        assert_eq!(flow.current_stage(), 1);
    }

    #[test]
    fn abandonment_advances_the_stage_and_charges_lost_bytes() {
        let now = Instant::now();
        let mut flow = Flow::new(3, Vec::new(), 0);

        flow.input(1, 0, payload("one"), now);
        flow.input(2, 0, payload("two"), now);

        let abandoned = flow.input(5, MESSAGE_ABANDON, Bytes::from(vec![0_u8; 100]), now);
        assert_eq!(abandoned.messages.len(), 0, "An abandonment delivers nothing");
        assert_eq!(flow.current_stage(), 5, "Cursor must jump to the abandoned stage");

        // Stages 3, 4 and 5 estimated at half a packet each, plus the 100 carried bytes
        assert_eq!(flow.lost_bytes(), 3 * 596 + 100, "Unexpected lost byte estimate");

        let next = flow.input(6, 0, payload("six"), now);
        assert_eq!(next.messages, vec![payload("six")], "Stage 6 follows the abandonment");
    }

    #[test]
    fn abandonment_discards_buffered_fragments_below_it() {
        let now = Instant::now();
        let mut flow = Flow::new(7, Vec::new(), 0);

        flow.input(1, 0, payload("one"), now);
        flow.input(3, 0, payload("buffered"), now);

        flow.input(5, MESSAGE_ABANDON, Bytes::new(), now);
        assert_eq!(flow.current_stage(), 5);

        // 4 skipped stages at half a packet plus the 8 byte buffered fragment
        assert_eq!(flow.lost_bytes(), 3 * 596 + 8 + 596);

        let result = flow.input(6, 0, payload("six"), now);
        assert_eq!(result.messages, vec![payload("six")]);
    }

    #[test]
    fn split_message_is_reassembled_across_fragments() {
        let now = Instant::now();
        let mut flow = Flow::new(4, Vec::new(), 0);

        let first = flow.input(1, MESSAGE_WITH_AFTERPART, payload("he"), now);
        assert_eq!(first.messages.len(), 0, "First part must wait for the rest");

        let middle = flow.input(
            2,
            MESSAGE_WITH_BEFOREPART | MESSAGE_WITH_AFTERPART,
            payload("ll"),
            now,
        );
        assert_eq!(middle.messages.len(), 0, "Middle part must wait for the rest");

        let last = flow.input(3, MESSAGE_WITH_BEFOREPART, payload("o"), now);
        assert_eq!(last.messages, vec![payload("hello")], "Parts must reassemble in order");
    }

    #[test]
    fn continuation_without_a_beginning_is_counted_lost() {
        let now = Instant::now();
        let mut flow = Flow::new(4, Vec::new(), 0);

        let orphan = flow.input(1, MESSAGE_WITH_BEFOREPART, payload("tail"), now);
        assert_eq!(orphan.messages.len(), 0, "An orphan continuation must not deliver");
        assert_eq!(flow.lost_bytes(), 4, "The orphan bytes must be charged as lost");
    }

    #[test]
    fn ack_describes_buffered_islands() {
        let now = Instant::now();
        let mut flow = Flow::new(9, Vec::new(), 0);

        flow.input(1, 0, payload("one"), now);
        flow.input(4, 0, payload("four"), now);
        flow.input(5, 0, payload("five"), now);
        flow.input(8, 0, payload("eight"), now);

        let ack = flow.build_ack(now);
        assert_eq!(ack.flow_id, 9);
        assert_eq!(ack.cumulative_ack, 1, "Only stage 1 is delivered");
        assert_eq!(
            ack.ranges,
            vec![(1, 1), (1, 0)],
            "Expected islands at 4..5 and 8 encoded as (missing-1, run-1)"
        );
    }

    #[test]
    fn completed_flow_keeps_accepting_stages_for_acks() {
        let now = Instant::now();
        let mut flow = Flow::new(2, Vec::new(), 0);

        let result = flow.input(1, MESSAGE_END, payload("only"), now);
        assert!(result.ended);

        // A retransmitted final stage must not deliver anything new
        let repeat = flow.input(1, MESSAGE_END, payload("only"), now);
        assert_eq!(repeat.messages.len(), 0);
        assert!(!repeat.ended, "The end must only be reported once");
    }

    #[test]
    fn ended_flow_is_prunable_after_the_grace_period() {
        let now = Instant::now();
        let mut flow = Flow::new(2, Vec::new(), 0);
        flow.input(1, MESSAGE_END, payload("only"), now);

        assert!(!flow.can_be_pruned(now + std::time::Duration::from_secs(119)));
        assert!(flow.can_be_pruned(now + std::time::Duration::from_secs(120)));
    }
}
