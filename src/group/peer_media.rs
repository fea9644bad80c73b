use std::time::Instant;

/// The view a [`super::GroupMedia`] keeps of one neighbor peer: which push masks are active
/// in both directions and which fragments the peer advertised in its last fragments map.
pub struct PeerMedia {
    /// Hex peer id of the neighbor
    pub peer_id: String,

    /// Masks we asked the peer to push to us
    pub push_in_mask: u8,

    /// Masks the peer asked us to push to it
    pub push_out_mask: u8,

    /// True once the group media announce went out to this peer
    pub group_media_sent: bool,

    /// When the peer's last fragments map arrived
    pub last_map_received: Option<Instant>,

    map_last_id: u64,
    map_bitmap: Vec<u8>,
}

impl PeerMedia {
    pub fn new(peer_id: String) -> PeerMedia {
        PeerMedia {
            peer_id,
            push_in_mask: 0,
            push_out_mask: 0,
            group_media_sent: false,
            last_map_received: None,
            map_last_id: 0,
            map_bitmap: Vec::new(),
        }
    }

    /// Records the peer's latest fragments map
    pub fn update_map(&mut self, last_id: u64, bitmap: Vec<u8>, now: Instant) {
        self.map_last_id = last_id;
        self.map_bitmap = bitmap;
        self.last_map_received = Some(now);
    }

    /// Highest fragment id the peer has advertised
    pub fn last_advertised(&self) -> u64 {
        self.map_last_id
    }

    /// True when the peer's last fragments map announces it holds `id`.  Bit `i` of the
    /// bitmap covers id `last - 1 - i`, least significant bit first.
    pub fn has_fragment(&self, id: u64) -> bool {
        if self.map_last_id == 0 || id > self.map_last_id {
            return false;
        }
        if id == self.map_last_id {
            return true;
        }

        let index = (self.map_last_id - 1 - id) as usize;
        let byte = index / 8;
        let bit = index % 8;
        match self.map_bitmap.get(byte) {
            Some(value) => value & (1 << bit) != 0,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_without_a_map_has_nothing() {
        let peer = PeerMedia::new("aa".to_string());
        assert!(!peer.has_fragment(1));
    }

    #[test]
    fn last_announced_fragment_is_always_held() {
        let mut peer = PeerMedia::new("aa".to_string());
        peer.update_map(10, Vec::new(), Instant::now());

        assert!(peer.has_fragment(10));
        assert!(!peer.has_fragment(11), "Ids beyond the map are not held");
    }

    #[test]
    fn bitmap_bits_scan_downward_from_the_last_id() {
        let mut peer = PeerMedia::new("aa".to_string());
        // last = 10; bit 0 covers 9, bit 1 covers 8, ...
        peer.update_map(10, vec![0b0000_0101], Instant::now());

        assert!(peer.has_fragment(9), "Bit 0 covers id 9");
        assert!(!peer.has_fragment(8), "Bit 1 is clear");
        assert!(peer.has_fragment(7), "Bit 2 covers id 7");
        assert!(!peer.has_fragment(2), "Ids past the bitmap are not held");
    }
}
