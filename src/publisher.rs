//! The publication side of the engine: one publisher fans pushed media out to any number
//! of listeners (peer writers or a group media fragmenter).
//!
//! The publisher remembers the codec configuration packets (the first AAC sequence header
//! and H.264 configuration) so a listener attached mid-stream starts with a decodable
//! stream, and it sheds non-key video frames when a listener queue backs up.  Audio is
//! never dropped.

use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::flash::{TYPE_AUDIO, TYPE_DATA_AMF3, TYPE_VIDEO};

/// Media frames a listener queue may hold before video shedding starts
const DEFAULT_QUEUE_LIMIT: usize = 256;

/// True when an FLV video payload is a key frame
pub fn is_key_frame(data: &[u8]) -> bool {
    !data.is_empty() && data[0] & 0xF0 == 0x10
}

/// True when an FLV audio payload is an AAC sequence header
pub fn is_aac_codec_config(data: &[u8]) -> bool {
    data.len() > 1 && data[0] >> 4 == 0x0A && data[1] == 0
}

/// True when an FLV video payload is an H.264 configuration record
pub fn is_h264_codec_config(data: &[u8]) -> bool {
    data.len() > 1 && data[0] == 0x17 && data[1] == 0
}

/// An enumeration defining all the possible errors that could occur while managing the
/// listeners of a publication.
#[derive(Debug, Error)]
pub enum PublisherError {
    /// Each listener identifier may subscribe once
    #[error("The listener {listener_id} is already subscribed to this publication")]
    AlreadySubscribed { listener_id: String },
}

/// One media frame queued towards a listener
#[derive(Debug, PartialEq, Clone)]
pub struct QueuedMedia {
    pub type_id: u8,
    pub time: u32,
    pub payload: Bytes,
    pub reliable: bool,
}

struct Listener {
    queue: VecDeque<QueuedMedia>,
    dropped_frames: u64,
}

/// A single publication with its listeners
pub struct Publisher {
    name: String,
    running: bool,
    audio_reliable: bool,
    video_reliable: bool,
    audio_codec: Option<(u32, Bytes)>,
    video_codec: Option<(u32, Bytes)>,
    listeners: BTreeMap<String, Listener>,
    queue_limit: usize,
}

impl Publisher {
    pub fn new(name: String, audio_reliable: bool, video_reliable: bool) -> Publisher {
        Publisher {
            name,
            running: false,
            audio_reliable,
            video_reliable,
            audio_codec: None,
            video_codec: None,
            listeners: BTreeMap::new(),
            queue_limit: DEFAULT_QUEUE_LIMIT,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// The cached AAC sequence header, when one was seen
    pub fn audio_codec_packet(&self) -> Option<&(u32, Bytes)> {
        self.audio_codec.as_ref()
    }

    /// The cached H.264 configuration, when one was seen
    pub fn video_codec_packet(&self) -> Option<&(u32, Bytes)> {
        self.video_codec.as_ref()
    }

    /// Subscribes a listener; it is immediately primed with the cached codec packets
    pub fn add_listener(&mut self, listener_id: &str) -> Result<(), PublisherError> {
        if self.listeners.contains_key(listener_id) {
            return Err(PublisherError::AlreadySubscribed {
                listener_id: listener_id.to_string(),
            });
        }

        let mut listener = Listener {
            queue: VecDeque::new(),
            dropped_frames: 0,
        };

        if let Some((time, payload)) = &self.audio_codec {
            listener.queue.push_back(QueuedMedia {
                type_id: TYPE_AUDIO,
                time: *time,
                payload: payload.clone(),
                reliable: true,
            });
        }
        if let Some((time, payload)) = &self.video_codec {
            listener.queue.push_back(QueuedMedia {
                type_id: TYPE_VIDEO,
                time: *time,
                payload: payload.clone(),
                reliable: true,
            });
        }

        debug!(listener = %listener_id, publication = %self.name, "Listener subscribed");
        self.listeners.insert(listener_id.to_string(), listener);
        Ok(())
    }

    pub fn remove_listener(&mut self, listener_id: &str) {
        if self.listeners.remove(listener_id).is_some() {
            debug!(listener = %listener_id, publication = %self.name, "Listener removed");
        }
    }

    /// Queues an audio frame towards every listener.  Audio is never shed.
    pub fn push_audio(&mut self, time: u32, payload: Bytes) {
        if is_aac_codec_config(&payload) {
            trace!(publication = %self.name, "AAC sequence header cached");
            self.audio_codec = Some((time, payload.clone()));
        }

        let reliable = self.audio_reliable;
        for listener in self.listeners.values_mut() {
            listener.queue.push_back(QueuedMedia {
                type_id: TYPE_AUDIO,
                time,
                payload: payload.clone(),
                reliable,
            });
        }
    }

    /// Queues a video frame towards every listener whose queue can take it.  A frame that
    /// would push a queue past its bound is dropped unless it is a key frame or a codec
    /// configuration.
    pub fn push_video(&mut self, time: u32, payload: Bytes) {
        if is_h264_codec_config(&payload) {
            trace!(publication = %self.name, "H264 configuration cached");
            self.video_codec = Some((time, payload.clone()));
        }

        let reliable = self.video_reliable;
        let must_keep = is_key_frame(&payload) || is_h264_codec_config(&payload);
        let limit = self.queue_limit;

        for (listener_id, listener) in self.listeners.iter_mut() {
            if !must_keep && listener.queue.len() >= limit {
                listener.dropped_frames += 1;
                warn!(
                    listener = %listener_id,
                    dropped = listener.dropped_frames,
                    "Listener congested, video frame dropped"
                );
                continue;
            }

            listener.queue.push_back(QueuedMedia {
                type_id: TYPE_VIDEO,
                time,
                payload: payload.clone(),
                reliable,
            });
        }
    }

    /// Queues a data frame towards every listener
    pub fn push_data(&mut self, time: u32, payload: Bytes) {
        for listener in self.listeners.values_mut() {
            listener.queue.push_back(QueuedMedia {
                type_id: TYPE_DATA_AMF3,
                time,
                payload: payload.clone(),
                reliable: true,
            });
        }
    }

    /// Drains every listener queue, returning `(listener id, frame)` pairs in queue order
    pub fn flush(&mut self) -> Vec<(String, QueuedMedia)> {
        let mut frames = Vec::new();
        for (listener_id, listener) in self.listeners.iter_mut() {
            while let Some(frame) = listener.queue.pop_front() {
                frames.push((listener_id.clone(), frame));
            }
        }

        frames
    }

    /// True when shedding has not kept a listener queue under twice its bound; the session
    /// should close with the output congested reason
    pub fn is_congested(&self) -> bool {
        self.listeners
            .values()
            .any(|listener| listener.queue.len() >= self.queue_limit * 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyframe() -> Bytes {
        Bytes::from_static(&[0x17, 0x01, 0x00])
    }

    fn interframe() -> Bytes {
        Bytes::from_static(&[0x27, 0x01, 0x00])
    }

    #[test]
    fn codec_predicates_match_the_flv_layouts() {
        assert!(is_key_frame(&[0x17, 0x01]));
        assert!(!is_key_frame(&[0x27, 0x01]));
        assert!(!is_key_frame(&[]));

        assert!(is_aac_codec_config(&[0xAF, 0x00]));
        assert!(!is_aac_codec_config(&[0xAF, 0x01]));

        assert!(is_h264_codec_config(&[0x17, 0x00]));
        assert!(!is_h264_codec_config(&[0x17, 0x01]));
    }

    #[test]
    fn late_listener_is_primed_with_codec_packets() {
        let mut publisher = Publisher::new("stream".to_string(), true, false);
        publisher.start();

        publisher.push_audio(10, Bytes::from_static(&[0xAF, 0x00, 0x12]));
        publisher.push_video(20, Bytes::from_static(&[0x17, 0x00, 0x34]));
        publisher.push_video(30, interframe());

        publisher.add_listener("late-peer").unwrap();
        let frames = publisher.flush();

        assert_eq!(frames.len(), 2, "The late listener only gets the codec packets");
        assert_eq!(frames[0].1.type_id, TYPE_AUDIO);
        assert_eq!(frames[0].1.payload.as_ref(), &[0xAF, 0x00, 0x12]);
        assert_eq!(frames[1].1.type_id, TYPE_VIDEO);
        assert_eq!(frames[1].1.payload.as_ref(), &[0x17, 0x00, 0x34]);
    }

    #[test]
    fn duplicate_listener_is_rejected() {
        let mut publisher = Publisher::new("stream".to_string(), true, true);
        publisher.add_listener("peer").unwrap();

        match publisher.add_listener("peer") {
            Err(PublisherError::AlreadySubscribed { listener_id }) => {
                assert_eq!(listener_id, "peer")
            }
            Ok(_) => panic!("Expected AlreadySubscribed error but the listener was added"),
        }
    }

    #[test]
    fn congested_listener_sheds_interframes_but_never_audio() {
        let mut publisher = Publisher::new("stream".to_string(), true, false);
        publisher.add_listener("slow-peer").unwrap();

        // Fill the queue to its bound
        for index in 0..DEFAULT_QUEUE_LIMIT {
            publisher.push_video(index as u32, keyframe());
        }

        // Interframes are shed, audio and keyframes still land
        publisher.push_video(9999, interframe());
        publisher.push_audio(9999, Bytes::from_static(&[0xAF, 0x01, 0x55]));
        publisher.push_video(10000, keyframe());

        let frames = publisher.flush();
        assert_eq!(
            frames.len(),
            DEFAULT_QUEUE_LIMIT + 2,
            "Exactly the interframe must have been dropped"
        );
        assert!(
            frames.iter().all(|(_, frame)| frame.payload.as_ref() != interframe().as_ref()),
            "The interframe must not survive congestion"
        );
    }

    #[test]
    fn flush_preserves_queue_order_per_listener() {
        let mut publisher = Publisher::new("stream".to_string(), true, true);
        publisher.add_listener("peer").unwrap();

        publisher.push_audio(1, Bytes::from_static(&[0xAF, 0x01, 0x01]));
        publisher.push_video(2, keyframe());
        publisher.push_data(3, Bytes::from_static(b"meta"));

        let frames = publisher.flush();
        let types: Vec<u8> = frames.iter().map(|(_, frame)| frame.type_id).collect();
        assert_eq!(types, vec![TYPE_AUDIO, TYPE_VIDEO, TYPE_DATA_AMF3]);

        assert_eq!(publisher.flush().len(), 0, "A second flush drains nothing new");
    }

    #[test]
    fn reliability_follows_the_publication_configuration() {
        let mut publisher = Publisher::new("stream".to_string(), false, true);
        publisher.add_listener("peer").unwrap();

        publisher.push_audio(1, Bytes::from_static(&[0xAF, 0x01, 0x01]));
        publisher.push_video(2, keyframe());

        let frames = publisher.flush();
        assert!(!frames[0].1.reliable, "Audio reliability must follow the configuration");
        assert!(frames[1].1.reliable, "Video reliability must follow the configuration");
    }
}
