use bytes::Bytes;

/// Largest payload a single group fragment may carry; bigger media messages are split into
/// start/next/end runs that reassemble in id order
pub const GROUP_FRAGMENT_SIZE: usize = 959;

/// How a fragment relates to the media message it carries
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum FragmentMarker {
    /// The whole message fits this fragment
    Data,
    /// First fragment of a split message
    Start,
    /// Middle fragment of a split message
    Next,
    /// Last fragment of a split message
    End,
}

/// One numbered piece of the group media stream
#[derive(Debug, PartialEq, Clone)]
pub struct GroupFragment {
    pub id: u64,
    pub marker: FragmentMarker,

    /// Number of fragments still to come in this split message (zero on Data and End)
    pub split_index: u8,

    /// Media message type (audio, video, data, invocation)
    pub type_id: u8,

    /// Media time of the carried message
    pub time: u32,

    pub payload: Bytes,
}

/// Cuts one media message into numbered fragments, advancing the shared fragment counter.
/// A message that fits a single fragment gets the plain data marker.
pub fn fragment_media(
    fragment_counter: &mut u64,
    type_id: u8,
    time: u32,
    payload: Bytes,
) -> Vec<GroupFragment> {
    if payload.is_empty() {
        return Vec::new();
    }

    if payload.len() <= GROUP_FRAGMENT_SIZE {
        *fragment_counter += 1;
        return vec![GroupFragment {
            id: *fragment_counter,
            marker: FragmentMarker::Data,
            split_index: 0,
            type_id,
            time,
            payload,
        }];
    }

    let total = (payload.len() + GROUP_FRAGMENT_SIZE - 1) / GROUP_FRAGMENT_SIZE;
    let mut fragments = Vec::with_capacity(total);

    let mut offset = 0;
    let mut index = 0;
    while offset < payload.len() {
        let end = (offset + GROUP_FRAGMENT_SIZE).min(payload.len());
        let remaining = total - index - 1;
        let marker = if index == 0 {
            FragmentMarker::Start
        } else if remaining == 0 {
            FragmentMarker::End
        } else {
            FragmentMarker::Next
        };

        *fragment_counter += 1;
        fragments.push(GroupFragment {
            id: *fragment_counter,
            marker,
            split_index: remaining as u8,
            type_id,
            time,
            payload: payload.slice(offset..end),
        });

        offset = end;
        index += 1;
    }

    fragments
}
