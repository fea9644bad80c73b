use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::fragment::{FragmentMarker, GroupFragment, GROUP_FRAGMENT_SIZE};

/// A media message reassembled from group fragments, ready for the player
#[derive(Debug, PartialEq)]
pub struct GroupMediaMessage {
    pub type_id: u8,
    pub time: u32,
    pub payload: Bytes,
}

struct QueuedFragment {
    marker: FragmentMarker,
    type_id: u8,
    time: u32,
    payload: Bytes,
    arrived: Instant,
}

/// Orders the fragments a [`super::GroupMedia`] stores into player-facing messages.
///
/// Delivery is strictly ascending in fragment id.  A split message leaves the buffer only
/// once its whole start..end run is present; gaps older than the window are skipped and
/// charged as lost.
pub struct GroupBuffer {
    window: Duration,
    next_id: u64,
    pending: BTreeMap<u64, QueuedFragment>,
    lost_bytes: u64,
}

impl GroupBuffer {
    pub fn new(window: Duration) -> GroupBuffer {
        GroupBuffer {
            window,
            next_id: 1,
            pending: BTreeMap::new(),
            lost_bytes: 0,
        }
    }

    /// Bytes charged to skipped gaps and dropped partial messages so far
    pub fn lost_bytes(&self) -> u64 {
        self.lost_bytes
    }

    /// Next fragment id the player is waiting on
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Queues one fragment and returns every message that became deliverable
    pub fn push(&mut self, fragment: &GroupFragment, now: Instant) -> Vec<GroupMediaMessage> {
        if fragment.id < self.next_id {
            return Vec::new();
        }

        self.pending.entry(fragment.id).or_insert(QueuedFragment {
            marker: fragment.marker,
            type_id: fragment.type_id,
            time: fragment.time,
            payload: fragment.payload.clone(),
            arrived: now,
        });

        self.drain()
    }

    /// The window was trimmed below `first_kept`; fragments below it will never arrive
    pub fn on_removed_fragments(&mut self, first_kept: u64) {
        if first_kept <= self.next_id {
            return;
        }

        let kept = self.pending.split_off(&first_kept);
        for (_, dropped) in std::mem::replace(&mut self.pending, kept) {
            self.lost_bytes += dropped.payload.len() as u64;
        }

        debug!(
            from = self.next_id,
            to = first_kept - 1,
            "Skipping fragments the window dropped"
        );
        self.next_id = first_kept;
    }

    /// Skips gaps that outlived the window, charging an estimate for what was missed, and
    /// returns whatever became deliverable behind them
    pub fn manage(&mut self, now: Instant) -> Vec<GroupMediaMessage> {
        let first_pending = match self.pending.iter().next() {
            Some((id, fragment)) => (*id, fragment.arrived),
            None => return Vec::new(),
        };

        if first_pending.0 <= self.next_id {
            return self.drain();
        }

        if now.duration_since(first_pending.1) <= self.window {
            return Vec::new();
        }

        let skipped = first_pending.0 - self.next_id;
        self.lost_bytes += skipped * (GROUP_FRAGMENT_SIZE as u64 / 2);
        debug!(
            from = self.next_id,
            to = first_pending.0 - 1,
            "Gap older than the window, skipping"
        );
        self.next_id = first_pending.0;

        self.drain()
    }

    fn drain(&mut self) -> Vec<GroupMediaMessage> {
        let mut messages = Vec::new();

        loop {
            let marker = match self.pending.get(&self.next_id) {
                Some(fragment) => fragment.marker,
                None => break,
            };

            match marker {
                FragmentMarker::Data => {
                    let fragment = self
                        .pending
                        .remove(&self.next_id)
                        .expect("fragment was just observed");
                    messages.push(GroupMediaMessage {
                        type_id: fragment.type_id,
                        time: fragment.time,
                        payload: fragment.payload,
                    });
                    self.next_id += 1;
                }

                FragmentMarker::Start => {
                    // The run is deliverable only when start..end is fully present
                    let mut end_id = None;
                    let mut cursor = self.next_id + 1;
                    loop {
                        match self.pending.get(&cursor) {
                            Some(fragment) if fragment.marker == FragmentMarker::Next => {
                                cursor += 1;
                            }
                            Some(fragment) if fragment.marker == FragmentMarker::End => {
                                end_id = Some(cursor);
                                break;
                            }
                            _ => break,
                        }
                    }

                    let end_id = match end_id {
                        Some(x) => x,
                        None => break, // still incomplete
                    };

                    let mut payload = Vec::new();
                    let start = self
                        .pending
                        .remove(&self.next_id)
                        .expect("fragment was just observed");
                    payload.extend_from_slice(&start.payload);
                    for id in (self.next_id + 1)..=end_id {
                        let part = self.pending.remove(&id).expect("run was just verified");
                        payload.extend_from_slice(&part.payload);
                    }

                    messages.push(GroupMediaMessage {
                        type_id: start.type_id,
                        time: start.time,
                        payload: Bytes::from(payload),
                    });
                    self.next_id = end_id + 1;
                }

                FragmentMarker::Next | FragmentMarker::End => {
                    // The start of this message was skipped; its pieces are lost
                    let fragment = self
                        .pending
                        .remove(&self.next_id)
                        .expect("fragment was just observed");
                    self.lost_bytes += fragment.payload.len() as u64;
                    self.next_id += 1;
                }
            }
        }

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_fragment(id: u64, payload: &'static [u8]) -> GroupFragment {
        GroupFragment {
            id,
            marker: FragmentMarker::Data,
            split_index: 0,
            type_id: 0x08,
            time: id as u32,
            payload: Bytes::from_static(payload),
        }
    }

    fn split_fragment(id: u64, marker: FragmentMarker, payload: &'static [u8]) -> GroupFragment {
        GroupFragment {
            id,
            marker,
            split_index: 0,
            type_id: 0x09,
            time: 500,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn fragments_deliver_in_ascending_id_order() {
        let now = Instant::now();
        let mut buffer = GroupBuffer::new(Duration::from_secs(8));

        assert_eq!(buffer.push(&data_fragment(2, b"two"), now).len(), 0);
        let delivered = buffer.push(&data_fragment(1, b"one"), now);

        assert_eq!(delivered.len(), 2, "Both fragments must deliver once 1 arrives");
        assert_eq!(delivered[0].payload.as_ref(), b"one");
        assert_eq!(delivered[1].payload.as_ref(), b"two");
        assert_eq!(buffer.next_id(), 3);
    }

    #[test]
    fn split_message_waits_for_its_whole_run() {
        let now = Instant::now();
        let mut buffer = GroupBuffer::new(Duration::from_secs(8));

        assert_eq!(
            buffer
                .push(&split_fragment(1, FragmentMarker::Start, b"he"), now)
                .len(),
            0,
            "A start fragment alone must not deliver"
        );
        assert_eq!(
            buffer
                .push(&split_fragment(3, FragmentMarker::End, b"o"), now)
                .len(),
            0,
            "The run is still missing its middle"
        );

        let delivered = buffer.push(&split_fragment(2, FragmentMarker::Next, b"ll"), now);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload.as_ref(), b"hello");
        assert_eq!(delivered[0].type_id, 0x09);
        assert_eq!(buffer.next_id(), 4);
    }

    #[test]
    fn old_gaps_are_skipped_and_charged() {
        let start = Instant::now();
        let mut buffer = GroupBuffer::new(Duration::from_secs(8));

        buffer.push(&data_fragment(1, b"one"), start);
        buffer.push(&data_fragment(5, b"five"), start);

        // Inside the window the gap holds delivery
        assert_eq!(buffer.manage(start + Duration::from_secs(7)).len(), 0);
        assert_eq!(buffer.lost_bytes(), 0);

        // Past the window the gap is skipped and estimated as lost
        let delivered = buffer.manage(start + Duration::from_secs(9));
        assert_eq!(delivered.len(), 1, "Fragment 5 must deliver after the skip");
        assert_eq!(delivered[0].payload.as_ref(), b"five");
        assert_eq!(buffer.lost_bytes(), 3 * (GROUP_FRAGMENT_SIZE as u64 / 2));
        assert_eq!(buffer.next_id(), 6);
    }

    #[test]
    fn window_removal_advances_the_cursor() {
        let now = Instant::now();
        let mut buffer = GroupBuffer::new(Duration::from_secs(8));

        buffer.push(&data_fragment(3, b"three"), now);
        buffer.on_removed_fragments(3);

        let delivered = buffer.manage(now);
        assert_eq!(delivered.len(), 1, "Fragment 3 survives the removal cut");
        assert_eq!(buffer.next_id(), 4);
    }

    #[test]
    fn orphan_continuations_are_charged_as_lost() {
        let now = Instant::now();
        let mut buffer = GroupBuffer::new(Duration::from_secs(8));

        // The start (id 1) never arrives; ids 2 and 3 are the tail of its message
        buffer.push(&split_fragment(2, FragmentMarker::Next, b"ll"), now);
        buffer.push(&split_fragment(3, FragmentMarker::End, b"o"), now);
        buffer.push(&data_fragment(4, b"four"), now);

        buffer.on_removed_fragments(2);
        let delivered = buffer.manage(now);

        assert_eq!(delivered.len(), 1, "Only the whole message may deliver");
        assert_eq!(delivered[0].payload.as_ref(), b"four");
        assert_eq!(buffer.lost_bytes(), 3, "The orphan tail bytes must be charged");
    }
}
