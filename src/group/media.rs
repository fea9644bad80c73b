use bytes::Bytes;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::config::GroupConfig;
use super::fragment::{fragment_media, FragmentMarker, GroupFragment};
use super::peer_media::PeerMedia;
use super::GroupMessage;

// A GroupMedia with no received fragment for this long is dead
const MEDIA_TIMEOUT: Duration = Duration::from_secs(300);

// Cadence of the pull engine
const PULL_DELAY: Duration = Duration::from_millis(50);

// Cadence of the push mask rotation
const PUSH_DELAY: Duration = Duration::from_secs(2);

// Outstanding pulls beyond this start the congestion clock
const PULL_LIMIT: usize = 100;

// Congestion persisting this long kills the group media
const PULL_TIMEOUT: Duration = Duration::from_secs(8);

/// A single action that is returned when the group media engine reacts to messages or
/// timers.  The owner maps peer sends onto the writer of the peer's group flow.
#[derive(Debug)]
pub enum GroupMediaAction {
    /// A group message to deliver to one neighbor
    SendToPeer {
        peer_id: String,
        message: GroupMessage,
        reliable: bool,
    },

    /// A fragment entered the store; the group buffer orders it for the player
    NewFragment(GroupFragment),

    /// The window was trimmed; everything below `first_kept` is gone
    RemovedFragments { first_kept: u64 },

    /// The pull engine stayed congested past its deadline; the group should close with
    /// the pull timeout reason
    PullTimeout,
}

/// The distribution engine of one NetGroup media stream.
///
/// It owns the fragment store and the per-peer views, answers pulls, fans new fragments out
/// to push subscribers, elects push masks, emits availability maps and trims the window by
/// wall clock.  Publishers feed it whole media messages; subscribers feed it the fragments
/// their neighbors send.
pub struct GroupMedia {
    pub stream_name: String,
    pub stream_key: Vec<u8>,
    config: GroupConfig,

    fragment_counter: u64,
    fragments: BTreeMap<u64, GroupFragment>,
    time_index: BTreeMap<Instant, u64>,

    peers: BTreeMap<String, PeerMedia>,

    // Pull engine state
    pull_time_index: BTreeMap<Instant, u64>,
    waiting_pulls: BTreeMap<u64, Instant>,
    pull_cursor: u64,
    last_map_id: u64,
    pull_paused: bool,
    pull_congested_since: Option<Instant>,
    last_pull_tick: Option<Instant>,

    // Push engine state
    current_push_mask: u8,
    push_masks: HashMap<u8, (String, u64)>,
    push_rotation: usize,
    started_push_requests: bool,
    last_push_tick: Option<Instant>,

    // Availability state
    last_map_sent: Option<Instant>,
    map_rotation: usize,

    last_fragment_rx: Instant,
    end_fragment: Option<u64>,
}

impl GroupMedia {
    pub fn new(
        stream_name: String,
        stream_key: Vec<u8>,
        config: GroupConfig,
        now: Instant,
    ) -> GroupMedia {
        GroupMedia {
            stream_name,
            stream_key,
            config,
            fragment_counter: 0,
            fragments: BTreeMap::new(),
            time_index: BTreeMap::new(),
            peers: BTreeMap::new(),
            pull_time_index: BTreeMap::new(),
            waiting_pulls: BTreeMap::new(),
            pull_cursor: 0,
            last_map_id: 0,
            pull_paused: false,
            pull_congested_since: None,
            last_pull_tick: None,
            current_push_mask: 0,
            push_masks: HashMap::new(),
            push_rotation: 0,
            started_push_requests: false,
            last_push_tick: None,
            last_map_sent: None,
            map_rotation: 0,
            last_fragment_rx: now,
            end_fragment: None,
        }
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn fragment_ids(&self) -> Vec<u64> {
        self.fragments.keys().copied().collect()
    }

    pub fn pull_cursor(&self) -> u64 {
        self.pull_cursor
    }

    pub fn waiting_pull_count(&self) -> usize {
        self.waiting_pulls.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerMedia> {
        self.peers.get(peer_id)
    }

    /// Links a neighbor to this media: it immediately gets the announce and, when we hold
    /// anything, a first availability map
    pub fn add_peer(&mut self, peer_id: String, now: Instant) -> Vec<GroupMediaAction> {
        let mut actions = Vec::new();
        if self.peers.contains_key(&peer_id) {
            return actions;
        }

        debug!(peer = %peer_id, peers = self.peers.len() + 1, "Adding peer to group media");
        let mut peer = PeerMedia::new(peer_id.clone());
        peer.group_media_sent = true;
        self.peers.insert(peer_id.clone(), peer);

        actions.push(GroupMediaAction::SendToPeer {
            peer_id: peer_id.clone(),
            message: GroupMessage::MediaAnnounce {
                stream_name: self.stream_name.clone(),
                stream_key: self.stream_key.clone(),
                config: self.config.clone(),
            },
            reliable: true,
        });

        if let Some((last_fragment, bitmap)) = self.update_fragment_map(now, &mut actions) {
            actions.push(GroupMediaAction::SendToPeer {
                peer_id,
                message: GroupMessage::FragmentsMap {
                    last_fragment,
                    bitmap,
                },
                reliable: false,
            });
        }

        actions
    }

    /// Unlinks a neighbor and forgets every push mask it was serving
    pub fn remove_peer(&mut self, peer_id: &str) {
        if self.peers.remove(peer_id).is_none() {
            debug!(peer = %peer_id, "Unable to find peer for removal");
            return;
        }

        debug!(peer = %peer_id, peers = self.peers.len(), "Removed peer from group media");
        self.push_masks.retain(|_, (owner, _)| owner != peer_id);
    }

    /// Publisher entry point: cuts one media message into fragments and distributes them
    pub fn publish_media(
        &mut self,
        type_id: u8,
        time: u32,
        payload: Bytes,
        reliable: bool,
        now: Instant,
    ) -> Vec<GroupMediaAction> {
        let mut actions = Vec::new();
        let fragments = fragment_media(&mut self.fragment_counter, type_id, time, payload);
        trace!(
            count = fragments.len(),
            first = fragments.first().map(|f| f.id).unwrap_or(0),
            "Creating fragments"
        );

        for fragment in fragments {
            self.add_fragment(None, fragment, reliable, now, &mut actions);
        }

        actions
    }

    /// Ends the stream: every peer learns the final fragment id
    pub fn close(&mut self, now: Instant) -> Vec<GroupMediaAction> {
        let _ = now;
        self.fragment_counter += 1;
        let last_fragment = self.fragment_counter;
        self.end_fragment = Some(last_fragment);

        debug!(last_fragment, "Closing the group media");
        self.peers
            .keys()
            .map(|peer_id| GroupMediaAction::SendToPeer {
                peer_id: peer_id.clone(),
                message: GroupMessage::MediaClose { last_fragment },
                reliable: true,
            })
            .collect()
    }

    /// Processes one group message received from a neighbor
    pub fn handle_message(
        &mut self,
        peer_id: &str,
        message: GroupMessage,
        now: Instant,
    ) -> Vec<GroupMediaAction> {
        let mut actions = Vec::new();
        if !self.peers.contains_key(peer_id) {
            debug!(peer = %peer_id, "Group message from an unlinked peer, ignored");
            return actions;
        }

        match message {
            GroupMessage::FragmentsMap {
                last_fragment,
                bitmap,
            } => self.handle_fragments_map(peer_id, last_fragment, bitmap, now, &mut actions),

            GroupMessage::PushMask { mask } => {
                trace!(peer = %peer_id, mask, "Peer updated its push subscription");
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.push_out_mask = mask;
                }
            }

            GroupMessage::Pull { fragment_id } => match self.fragments.get(&fragment_id) {
                Some(fragment) => {
                    actions.push(GroupMediaAction::SendToPeer {
                        peer_id: peer_id.to_string(),
                        message: GroupMessage::Fragment(fragment.clone()),
                        reliable: true,
                    });
                }
                None => {
                    debug!(
                        peer = %peer_id,
                        fragment_id, "Peer asked for an unknown fragment, possibly trimmed"
                    );
                }
            },

            GroupMessage::Fragment(fragment) => {
                self.handle_fragment(peer_id, fragment, now, &mut actions)
            }

            GroupMessage::MediaClose { last_fragment } => {
                debug!(last_fragment, "The stream ended");
                self.end_fragment = Some(last_fragment);
            }

            GroupMessage::MediaAnnounce { .. } => {
                // The announce created this media at the group level already
                trace!(peer = %peer_id, "Duplicate media announce, ignored");
            }
        }

        actions
    }

    /// Runs the periodic work of the media: availability maps, pull requests, push mask
    /// rotation and the five minute death watch.  Returns false once the media should be
    /// destroyed.
    pub fn manage(&mut self, now: Instant) -> (Vec<GroupMediaAction>, bool) {
        let mut actions = Vec::new();

        if elapsed(self.last_map_sent, now) >= self.config.availability_update_period {
            self.last_map_sent = Some(now);
            self.send_fragments_map(now, &mut actions);
        }

        if !self.config.is_publisher {
            if now.duration_since(self.last_fragment_rx) >= MEDIA_TIMEOUT {
                debug!("No fragment received for five minutes, dropping the group media");
                return (actions, false);
            }

            if elapsed(self.last_pull_tick, now) >= PULL_DELAY {
                self.last_pull_tick = Some(now);
                self.send_pull_requests(now, &mut actions);
            }

            if self.started_push_requests && elapsed(self.last_push_tick, now) >= PUSH_DELAY {
                self.last_push_tick = Some(now);
                self.send_push_requests(&mut actions);
            }
        }

        (actions, true)
    }

    fn handle_fragments_map(
        &mut self,
        peer_id: &str,
        last_fragment: u64,
        bitmap: Vec<u8>,
        now: Instant,
        actions: &mut Vec<GroupMediaAction>,
    ) {
        if self.config.is_publisher {
            return;
        }

        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.update_map(last_fragment, bitmap, now);
        }

        if last_fragment > self.last_map_id {
            self.pull_time_index.insert(now, last_fragment);
            self.last_map_id = last_fragment;

            if self.pull_paused {
                debug!("Fragments map received, restarting the pull requests");
                self.pull_paused = false;
            }
        }

        // Push requests only ever start once a map proves the stream exists
        if !self.started_push_requests {
            self.started_push_requests = true;
            self.last_push_tick = Some(now);
            self.send_push_requests(actions);
        }
    }

    fn handle_fragment(
        &mut self,
        peer_id: &str,
        fragment: GroupFragment,
        now: Instant,
        actions: &mut Vec<GroupMediaAction>,
    ) {
        self.last_fragment_rx = now;
        let fragment_id = fragment.id;

        if self.waiting_pulls.remove(&fragment_id).is_some() {
            trace!(peer = %peer_id, fragment_id, "Waiting fragment received");
        } else {
            self.record_push_in(peer_id, fragment_id, actions);
        }

        if self.fragments.contains_key(&fragment_id) {
            trace!(fragment_id, "Fragment already received, ignored");
            return;
        }

        // Fragments older than the whole window are not worth keeping
        if self.time_index.len() > 2 {
            let oldest = self.time_index.iter().next();
            let newest = self.time_index.iter().next_back();
            if let (Some((old_time, old_id)), Some((new_time, _))) = (oldest, newest) {
                if new_time.duration_since(*old_time) > self.config.window_duration
                    && *old_id > fragment_id
                {
                    debug!(fragment_id, minimum = old_id, "Fragment too old, ignored");
                    return;
                }
            }
        }

        let reliable = fragment.type_id != crate::flash::TYPE_VIDEO;
        self.add_fragment(Some(peer_id), fragment, reliable, now, actions);
    }

    // Accounts a pushed fragment against the mask election: the first pusher of a mask owns
    // it, a faster pusher takes it over, and the slower one is demoted with the mask removed
    // from its subscription.
    fn record_push_in(
        &mut self,
        peer_id: &str,
        fragment_id: u64,
        actions: &mut Vec<GroupMediaAction>,
    ) {
        let mask = 1_u8 << (fragment_id % 8);
        let subscribed = self
            .peers
            .get(peer_id)
            .map(|peer| peer.push_in_mask & mask != 0)
            .unwrap_or(false);
        if !subscribed {
            debug!(peer = %peer_id, fragment_id, mask, "Unexpected fragment outside any mask");
            return;
        }

        match self.push_masks.get_mut(&mask) {
            None => {
                self.push_masks
                    .insert(mask, (peer_id.to_string(), fragment_id));
            }
            Some((owner, last_id)) => {
                if owner != peer_id {
                    if *last_id < fragment_id {
                        // The new pusher is faster; demote the previous owner
                        debug!(mask, previous = %owner, "Updating the pusher of a mask");
                        let previous = owner.clone();
                        *owner = peer_id.to_string();
                        if let Some(peer) = self.peers.get_mut(&previous) {
                            peer.push_in_mask &= !mask;
                            actions.push(GroupMediaAction::SendToPeer {
                                peer_id: previous,
                                message: GroupMessage::PushMask {
                                    mask: peer.push_in_mask,
                                },
                                reliable: true,
                            });
                        }
                    } else {
                        // The tested pusher is slower than the current one; demote it
                        trace!(mask, peer = %peer_id, "Pusher is slower than the current one");
                        if let Some(peer) = self.peers.get_mut(peer_id) {
                            peer.push_in_mask &= !mask;
                            actions.push(GroupMediaAction::SendToPeer {
                                peer_id: peer_id.to_string(),
                                message: GroupMessage::PushMask {
                                    mask: peer.push_in_mask,
                                },
                                reliable: true,
                            });
                        }
                        return;
                    }
                }

                if let Some((_, last_id)) = self.push_masks.get_mut(&mask) {
                    if *last_id < fragment_id {
                        *last_id = fragment_id;
                    }
                }
            }
        }
    }

    fn add_fragment(
        &mut self,
        source: Option<&str>,
        fragment: GroupFragment,
        reliable: bool,
        now: Instant,
        actions: &mut Vec<GroupMediaAction>,
    ) {
        let fragment_id = fragment.id;
        let starts_message = fragment.marker == FragmentMarker::Data
            || fragment.marker == FragmentMarker::Start;

        if starts_message {
            let newest = self.time_index.values().next_back().copied().unwrap_or(0);
            if fragment_id > newest {
                self.time_index.insert(now, fragment_id);
            }
        }

        self.fragments.insert(fragment_id, fragment.clone());

        // Fan the fragment out to push subscribers, bounded by the push limit
        let mask = 1_u8 << (fragment_id % 8);
        let mut remaining = self.config.push_limit as usize + 1;
        for (peer_id, peer) in &self.peers {
            if Some(peer_id.as_str()) == source {
                continue;
            }
            if peer.push_out_mask & mask == 0 {
                continue;
            }

            actions.push(GroupMediaAction::SendToPeer {
                peer_id: peer_id.clone(),
                message: GroupMessage::Fragment(fragment.clone()),
                reliable,
            });

            remaining -= 1;
            if remaining == 0 {
                trace!(
                    limit = self.config.push_limit + 1,
                    fragment_id,
                    "Push limit reached for fragment"
                );
                break;
            }
        }

        actions.push(GroupMediaAction::NewFragment(fragment));
    }

    fn send_fragments_map(&mut self, now: Instant, actions: &mut Vec<GroupMediaAction>) {
        let (last_fragment, bitmap) = match self.update_fragment_map(now, actions) {
            Some(x) => x,
            None => return,
        };

        if self.config.availability_send_to_all {
            for peer_id in self.peers.keys() {
                actions.push(GroupMediaAction::SendToPeer {
                    peer_id: peer_id.clone(),
                    message: GroupMessage::FragmentsMap {
                        last_fragment,
                        bitmap: bitmap.clone(),
                    },
                    reliable: false,
                });
            }
        } else if !self.peers.is_empty() {
            // One neighbor at a time, round robin
            let keys: Vec<&String> = self.peers.keys().collect();
            let peer_id = keys[self.map_rotation % keys.len()].clone();
            self.map_rotation = self.map_rotation.wrapping_add(1);

            actions.push(GroupMediaAction::SendToPeer {
                peer_id,
                message: GroupMessage::FragmentsMap {
                    last_fragment,
                    bitmap,
                },
                reliable: false,
            });
        }
    }

    // Builds the availability bitmap, trimming the window first.  Returns the id to
    // announce and the bitmap covering everything below it.
    fn update_fragment_map(
        &mut self,
        now: Instant,
        actions: &mut Vec<GroupMediaAction>,
    ) -> Option<(u64, Vec<u8>)> {
        if self.fragments.is_empty() && self.end_fragment.is_none() {
            return None;
        }

        self.erase_old_fragments(now, actions);

        let first = self
            .fragments
            .keys()
            .next()
            .copied()
            .or(self.end_fragment)?;
        let last = self
            .fragments
            .keys()
            .next_back()
            .copied()
            .or(self.end_fragment)?;
        let announced = self.end_fragment.unwrap_or(last);

        let below = last.saturating_sub(first);
        let mut bitmap = vec![0_u8; ((below + 7) / 8) as usize];
        for index in 0..below {
            let id = last - 1 - index;
            // The publisher holds everything in the window; subscribers scan their store
            if self.config.is_publisher || self.fragments.contains_key(&id) {
                bitmap[(index / 8) as usize] |= 1 << (index % 8);
            }
        }

        Some((announced, bitmap))
    }

    fn erase_old_fragments(&mut self, now: Instant, actions: &mut Vec<GroupMediaAction>) {
        if self.fragments.is_empty() || self.time_index.is_empty() {
            return;
        }

        let retention = self.config.window_duration + self.config.relay_margin;
        let cut = match now.checked_sub(retention) {
            Some(x) => x,
            None => return,
        };

        // Nothing to do unless at least one reference fell behind the cut
        if self.time_index.range(..=cut).next().is_none() {
            return;
        }

        // The first reference recorded after the cut marks the first kept fragment.  When
        // every reference is old the newest is kept rather than dropping the whole stream.
        let first_kept = match self
            .time_index
            .range((std::ops::Bound::Excluded(cut), std::ops::Bound::Unbounded))
            .next()
            .map(|(_, id)| *id)
        {
            Some(x) => x,
            None => return,
        };

        let kept = self.fragments.split_off(&first_kept);
        let dropped = std::mem::replace(&mut self.fragments, kept).len();
        if dropped == 0 {
            return;
        }

        debug!(dropped, first_kept, "Trimmed fragments outside the window");
        self.time_index.retain(|time, _| *time > cut);
        self.pull_time_index.retain(|time, _| *time > cut);

        let stale: Vec<u64> = self
            .waiting_pulls
            .range(..first_kept)
            .map(|(id, _)| *id)
            .collect();
        if !stale.is_empty() {
            warn!(
                from = stale.first().copied().unwrap_or(0),
                to = stale.last().copied().unwrap_or(0),
                "Deleting waiting pulls the window left behind"
            );
            for id in stale {
                self.waiting_pulls.remove(&id);
            }
        }

        if self.pull_cursor < first_kept {
            self.pull_cursor = first_kept;
        }

        actions.push(GroupMediaAction::RemovedFragments { first_kept });
    }

    fn send_pull_requests(&mut self, now: Instant, actions: &mut Vec<GroupMediaAction>) {
        if self.peers.is_empty() || self.pull_time_index.is_empty() || self.pull_paused {
            return;
        }

        // A stream that stopped delivering entirely is not worth pulling from
        if now.duration_since(self.last_fragment_rx)
            > self.config.window_duration + self.config.relay_margin
        {
            return;
        }

        // No map for a whole fetch period pauses the pull engine until the next map
        if let Some((newest_time, _)) = self.pull_time_index.iter().next_back() {
            if now.duration_since(*newest_time) > self.config.fetch_period {
                debug!("No fragments map within the fetch period, pull paused");
                self.pull_paused = true;
                return;
            }
        }

        // The pull target: the newest advertised id that has had a whole fetch period to
        // arrive by push
        let cut = match now.checked_sub(self.config.fetch_period) {
            Some(x) => x,
            None => return,
        };
        let target = match self.pull_time_index.range(..=cut).next_back().map(|(_, id)| *id) {
            Some(x) => x,
            None => return, // still waiting for the fetch period to elapse
        };

        // Re-issue pulls that outlived the fetch period, round robin to the next holder
        let overdue: Vec<u64> = self
            .waiting_pulls
            .iter()
            .filter(|(id, requested)| {
                **id <= target && now.duration_since(**requested) >= self.config.fetch_period
            })
            .map(|(id, _)| *id)
            .collect();
        for fragment_id in overdue {
            debug!(fragment_id, "Fetch period elapsed without the fragment, retrying");
            if self.send_pull_to_holder(fragment_id, actions) {
                self.waiting_pulls.insert(fragment_id, now);
            }
        }

        // Walk the holes up to the target
        let mut contiguous = true;
        for fragment_id in (self.pull_cursor + 1)..=target {
            if self.fragments.contains_key(&fragment_id) {
                if contiguous {
                    self.pull_cursor = fragment_id;
                }
                continue;
            }

            contiguous = false;
            if self.waiting_pulls.contains_key(&fragment_id) {
                continue;
            }

            if !self.send_pull_to_holder(fragment_id, actions) {
                break; // nobody holds it yet, wait for availability
            }
            self.waiting_pulls.insert(fragment_id, now);
        }

        // Congestion watch
        if !self.config.disable_pull_timeout {
            if self.waiting_pulls.len() > PULL_LIMIT {
                match self.pull_congested_since {
                    None => {
                        debug!(
                            waiting = self.waiting_pulls.len(),
                            "Too many pull requests, congestion clock started"
                        );
                        self.pull_congested_since = Some(now);
                    }
                    Some(since) => {
                        if now.duration_since(since) >= PULL_TIMEOUT {
                            actions.push(GroupMediaAction::PullTimeout);
                        }
                    }
                }
            } else {
                self.pull_congested_since = None;
            }
        }
    }

    fn send_pull_to_holder(&mut self, fragment_id: u64, actions: &mut Vec<GroupMediaAction>) -> bool {
        let holders: Vec<&String> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.has_fragment(fragment_id))
            .map(|(peer_id, _)| peer_id)
            .collect();
        if holders.is_empty() {
            trace!(fragment_id, "No peer holds the fragment yet");
            return false;
        }

        let start = rand::thread_rng().gen_range(0..holders.len());
        let peer_id = holders[start].clone();
        actions.push(GroupMediaAction::SendToPeer {
            peer_id,
            message: GroupMessage::Pull { fragment_id },
            reliable: true,
        });

        true
    }

    fn send_push_requests(&mut self, actions: &mut Vec<GroupMediaAction>) {
        if self.peers.is_empty() {
            return;
        }

        // First mask is random, the next ones rotate by left shift
        self.current_push_mask = match self.current_push_mask {
            0 => 1 << (rand::thread_rng().gen_range(0..8_u8)),
            0x80 => 1,
            mask => mask << 1,
        };
        let mask = self.current_push_mask;
        trace!(mask, "Rotating the push mask");

        // The next peer not already pushing this mask gets the subscription
        let keys: Vec<String> = self.peers.keys().cloned().collect();
        for offset in 0..keys.len() {
            let peer_id = &keys[(self.push_rotation + offset) % keys.len()];
            let peer = self.peers.get_mut(peer_id).expect("key comes from the map");
            if peer.push_in_mask & mask != 0 {
                continue;
            }

            peer.push_in_mask |= mask;
            actions.push(GroupMediaAction::SendToPeer {
                peer_id: peer_id.clone(),
                message: GroupMessage::PushMask {
                    mask: peer.push_in_mask,
                },
                reliable: true,
            });
            self.push_rotation = self.push_rotation.wrapping_add(offset + 1);
            return;
        }

        trace!(mask, "No new peer available for the mask");
    }
}

fn elapsed(since: Option<Instant>, now: Instant) -> Duration {
    match since {
        Some(time) => now.duration_since(time),
        None => Duration::MAX,
    }
}
