//! The NetGroup layer: a set of peers sharing a hashed group id and exchanging the
//! fragments of a common live stream.
//!
//! [`GroupMedia`] is the distribution engine (fragment store, availability maps, push
//! masks, pulls, window trimming); [`GroupBuffer`] reorders delivered fragments for the
//! player; the message codec here is the wire vocabulary both speak over a dedicated flow.

mod buffer;
mod config;
mod errors;
mod fragment;
mod media;
mod peer_media;

pub use self::buffer::{GroupBuffer, GroupMediaMessage};
pub use self::config::GroupConfig;
pub use self::errors::GroupMessageError;
pub use self::fragment::{fragment_media, FragmentMarker, GroupFragment, GROUP_FRAGMENT_SIZE};
pub use self::media::{GroupMedia, GroupMediaAction};
pub use self::peer_media::PeerMedia;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use std::time::Duration;

use crate::handshake::peer_id_to_hex;
use crate::messages::{read_u64_7bit, write_u64_7bit};

pub const GROUP_MEDIA_ANNOUNCE: u8 = 0x0C;
pub const GROUP_MEDIA_CLOSE: u8 = 0x0D;
pub const GROUP_MEDIA_DATA: u8 = 0x20;
pub const GROUP_MEDIA_START: u8 = 0x21;
pub const GROUP_MEDIA_NEXT: u8 = 0x22;
pub const GROUP_MEDIA_END: u8 = 0x23;
pub const GROUP_FRAGMENTS_MAP: u8 = 0x30;
pub const GROUP_PUSH_MASK: u8 = 0x31;
pub const GROUP_PULL: u8 = 0x32;

/// Derives the hex group id: two rounds of SHA-256 over the user supplied group name
pub fn group_id_hex(group_name: &str) -> String {
    let first = Sha256::digest(group_name.as_bytes());
    let second = Sha256::digest(first);
    peer_id_to_hex(&second)
}

/// Every message NetGroup peers exchange on their dedicated flow
#[derive(Debug, PartialEq, Clone)]
pub enum GroupMessage {
    /// Announces a media stream to a neighbor: its name, key and distribution parameters
    MediaAnnounce {
        stream_name: String,
        stream_key: Vec<u8>,
        config: GroupConfig,
    },

    /// The stream ended at the given fragment
    MediaClose { last_fragment: u64 },

    /// Availability summary: the sender holds `last_fragment` and, scanning downward from
    /// `last_fragment - 1`, every id whose bitmap bit is set (least significant bit first)
    FragmentsMap { last_fragment: u64, bitmap: Vec<u8> },

    /// Subscribes the sender to fragments whose `id % 8` bit is set in the mask
    PushMask { mask: u8 },

    /// Asks for a single fragment, reliably
    Pull { fragment_id: u64 },

    /// One media fragment
    Fragment(GroupFragment),
}

impl GroupMessage {
    pub fn write(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        match self {
            GroupMessage::MediaAnnounce {
                stream_name,
                stream_key,
                config,
            } => {
                bytes.push(GROUP_MEDIA_ANNOUNCE);
                write_u64_7bit(&mut bytes, stream_name.len() as u64).expect("writing to a vec");
                bytes.extend_from_slice(stream_name.as_bytes());
                write_u64_7bit(&mut bytes, stream_key.len() as u64).expect("writing to a vec");
                bytes.extend_from_slice(stream_key);
                write_u64_7bit(&mut bytes, config.window_duration.as_millis() as u64)
                    .expect("writing to a vec");
                write_u64_7bit(&mut bytes, config.relay_margin.as_millis() as u64)
                    .expect("writing to a vec");
                write_u64_7bit(&mut bytes, config.fetch_period.as_millis() as u64)
                    .expect("writing to a vec");
                write_u64_7bit(&mut bytes, config.availability_update_period.as_millis() as u64)
                    .expect("writing to a vec");
                bytes.push(config.push_limit);
                let mut flags = 0_u8;
                if config.availability_send_to_all {
                    flags |= 0x01;
                }
                if config.disable_pull_timeout {
                    flags |= 0x02;
                }
                bytes.push(flags);
            }
            GroupMessage::MediaClose { last_fragment } => {
                bytes.push(GROUP_MEDIA_CLOSE);
                write_u64_7bit(&mut bytes, *last_fragment).expect("writing to a vec");
            }
            GroupMessage::FragmentsMap {
                last_fragment,
                bitmap,
            } => {
                bytes.push(GROUP_FRAGMENTS_MAP);
                write_u64_7bit(&mut bytes, *last_fragment).expect("writing to a vec");
                bytes.extend_from_slice(bitmap);
            }
            GroupMessage::PushMask { mask } => {
                bytes.push(GROUP_PUSH_MASK);
                bytes.push(*mask);
            }
            GroupMessage::Pull { fragment_id } => {
                bytes.push(GROUP_PULL);
                write_u64_7bit(&mut bytes, *fragment_id).expect("writing to a vec");
            }
            GroupMessage::Fragment(fragment) => {
                let marker = match fragment.marker {
                    FragmentMarker::Data => GROUP_MEDIA_DATA,
                    FragmentMarker::Start => GROUP_MEDIA_START,
                    FragmentMarker::Next => GROUP_MEDIA_NEXT,
                    FragmentMarker::End => GROUP_MEDIA_END,
                };
                bytes.push(marker);
                write_u64_7bit(&mut bytes, fragment.id).expect("writing to a vec");
                if fragment.marker != FragmentMarker::Data {
                    bytes.push(fragment.split_index);
                }
                bytes.push(fragment.type_id);
                bytes.extend_from_slice(&fragment.time.to_be_bytes());
                bytes.extend_from_slice(&fragment.payload);
            }
        }

        bytes
    }

    pub fn parse(bytes: &[u8]) -> Result<GroupMessage, GroupMessageError> {
        let mut cursor = Cursor::new(bytes);
        let marker = cursor.read_u8()?;

        let message = match marker {
            GROUP_MEDIA_ANNOUNCE => {
                let name_length = read_u64_7bit(&mut cursor)? as usize;
                if name_length > bytes.len() {
                    return Err(GroupMessageError::MalformedMessage);
                }
                let mut name = vec![0_u8; name_length];
                cursor.read_exact(&mut name)?;

                let key_length = read_u64_7bit(&mut cursor)? as usize;
                if key_length > bytes.len() {
                    return Err(GroupMessageError::MalformedMessage);
                }
                let mut stream_key = vec![0_u8; key_length];
                cursor.read_exact(&mut stream_key)?;

                let mut config = GroupConfig::new();
                config.window_duration = Duration::from_millis(read_u64_7bit(&mut cursor)?);
                config.relay_margin = Duration::from_millis(read_u64_7bit(&mut cursor)?);
                config.fetch_period = Duration::from_millis(read_u64_7bit(&mut cursor)?);
                config.availability_update_period =
                    Duration::from_millis(read_u64_7bit(&mut cursor)?);
                config.push_limit = cursor.read_u8()?;
                let flags = cursor.read_u8()?;
                config.availability_send_to_all = flags & 0x01 != 0;
                config.disable_pull_timeout = flags & 0x02 != 0;

                GroupMessage::MediaAnnounce {
                    stream_name: String::from_utf8(name)
                        .map_err(|_| GroupMessageError::MalformedMessage)?,
                    stream_key,
                    config,
                }
            }
            GROUP_MEDIA_CLOSE => GroupMessage::MediaClose {
                last_fragment: read_u64_7bit(&mut cursor)?,
            },
            GROUP_FRAGMENTS_MAP => {
                let last_fragment = read_u64_7bit(&mut cursor)?;
                let position = cursor.position() as usize;
                GroupMessage::FragmentsMap {
                    last_fragment,
                    bitmap: bytes[position..].to_vec(),
                }
            }
            GROUP_PUSH_MASK => GroupMessage::PushMask {
                mask: cursor.read_u8()?,
            },
            GROUP_PULL => GroupMessage::Pull {
                fragment_id: read_u64_7bit(&mut cursor)?,
            },
            GROUP_MEDIA_DATA | GROUP_MEDIA_START | GROUP_MEDIA_NEXT | GROUP_MEDIA_END => {
                let id = read_u64_7bit(&mut cursor)?;
                let fragment_marker = match marker {
                    GROUP_MEDIA_DATA => FragmentMarker::Data,
                    GROUP_MEDIA_START => FragmentMarker::Start,
                    GROUP_MEDIA_NEXT => FragmentMarker::Next,
                    _ => FragmentMarker::End,
                };
                let split_index = if fragment_marker == FragmentMarker::Data {
                    0
                } else {
                    cursor.read_u8()?
                };
                let type_id = cursor.read_u8()?;
                let time = cursor.read_u32::<BigEndian>()?;
                let position = cursor.position() as usize;

                GroupMessage::Fragment(GroupFragment {
                    id,
                    marker: fragment_marker,
                    split_index,
                    type_id,
                    time,
                    payload: Bytes::copy_from_slice(&bytes[position..]),
                })
            }
            _ => return Err(GroupMessageError::UnknownMarker { marker }),
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_is_a_double_sha256_in_hex() {
        let id = group_id_hex("my group");
        assert_eq!(id.len(), 64, "A group id is 32 hex encoded bytes");
        assert_ne!(id, group_id_hex("my other group"));
        assert_eq!(id, group_id_hex("my group"), "The id must be deterministic");

        let first = Sha256::digest("my group".as_bytes());
        let second = Sha256::digest(first);
        assert_eq!(id, peer_id_to_hex(&second));
    }

    #[test]
    fn media_announce_round_trips() {
        let mut config = GroupConfig::new();
        config.availability_send_to_all = true;
        config.push_limit = 7;

        let message = GroupMessage::MediaAnnounce {
            stream_name: "live".to_string(),
            stream_key: vec![1, 2, 3, 4],
            config,
        };

        let bytes = message.write();
        assert_eq!(bytes[0], GROUP_MEDIA_ANNOUNCE);
        assert_eq!(GroupMessage::parse(&bytes).unwrap(), message);
    }

    #[test]
    fn fragments_map_round_trips() {
        let message = GroupMessage::FragmentsMap {
            last_fragment: 300,
            bitmap: vec![0xFF, 0x01],
        };

        let bytes = message.write();
        assert_eq!(bytes[0], GROUP_FRAGMENTS_MAP);
        assert_eq!(GroupMessage::parse(&bytes).unwrap(), message);
    }

    #[test]
    fn media_fragments_round_trip_with_every_marker() {
        for (marker, expected_byte) in [
            (FragmentMarker::Data, GROUP_MEDIA_DATA),
            (FragmentMarker::Start, GROUP_MEDIA_START),
            (FragmentMarker::Next, GROUP_MEDIA_NEXT),
            (FragmentMarker::End, GROUP_MEDIA_END),
        ] {
            let message = GroupMessage::Fragment(GroupFragment {
                id: 42,
                marker,
                split_index: if marker == FragmentMarker::Data { 0 } else { 3 },
                type_id: 0x09,
                time: 555,
                payload: Bytes::from_static(b"frame"),
            });

            let bytes = message.write();
            assert_eq!(bytes[0], expected_byte, "Unexpected marker byte");
            assert_eq!(GroupMessage::parse(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn pull_and_push_mask_round_trip() {
        for message in [
            GroupMessage::Pull { fragment_id: 4 },
            GroupMessage::PushMask { mask: 0b0010_0000 },
            GroupMessage::MediaClose { last_fragment: 99 },
        ] {
            let bytes = message.write();
            assert_eq!(GroupMessage::parse(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn unknown_marker_is_rejected() {
        match GroupMessage::parse(&[0x7F, 0, 0]) {
            Err(GroupMessageError::UnknownMarker { marker: 0x7F }) => {}
            Err(x) => panic!("Expected UnknownMarker error, instead received {}", x),
            Ok(x) => panic!("Expected UnknownMarker error but parsed {:?}", x),
        }
    }
}
