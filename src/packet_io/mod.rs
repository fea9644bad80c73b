//! Encryption and framing of raw RTMFP datagrams.
//!
//! Every UDP datagram exchanged by RTMFP peers is AES-128-CBC encrypted past its first four
//! bytes, carries an Internet style checksum of its plaintext, and hides the target session id
//! by XOR-packing it with the first two encrypted words.  This module turns raw datagrams into
//! decoded packets (and back) without caring how the bytes arrive or leave.

mod checksum;
mod cipher;
mod decoder;
mod encoder;
mod errors;

pub use self::checksum::checksum;
pub use self::cipher::{RtmfpCipher, DEFAULT_KEY, KEY_SIZE};
pub use self::decoder::{decode, unpack_session_id, DecodedPacket};
pub use self::encoder::{encode, init_packet, init_packet_with_echo, pack_session_id};
pub use self::errors::{PacketDecodeError, PacketEncodeError};

/// Size of the fixed datagram header: session id + checksum + marker + time + echo time
pub const HEADER_SIZE: usize = 11;

/// Smallest datagram that can carry a decodable packet
pub const MIN_PACKET_SIZE: usize = 12;

/// Largest datagram an RTMFP peer is expected to accept
pub const MAX_PACKET_SIZE: usize = 1192;

/// Marker bit signalling that an echo time field follows the time field
pub const MARKER_ECHO_TIME: u8 = 0x04;

/// Marker of a handshake packet
pub const MARKER_HANDSHAKE: u8 = 0x0B;

/// Marker of a raw (non AMF) session packet
pub const MARKER_RAW: u8 = 0x09;

/// Marker of an AMF session packet
pub const MARKER_AMF: u8 = 0x89;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::RtmfpTimestamp;

    #[test]
    fn packet_round_trips_through_encode_then_decode() {
        let cipher = RtmfpCipher::new(&[7_u8; KEY_SIZE]).unwrap();
        let mut packet = init_packet(MARKER_RAW, RtmfpTimestamp::new(1234));
        packet.extend_from_slice(&[0x18, 0x00, 0x03, 1, 2, 3]);

        let datagram = encode(&cipher, 0x12345678, packet).unwrap();
        let decoded = decode(&cipher, &datagram).unwrap();

        assert_eq!(decoded.session_id, 0x12345678, "Unexpected session id");
        assert_eq!(decoded.marker, MARKER_RAW, "Unexpected marker");
        assert_eq!(decoded.time, RtmfpTimestamp::new(1234), "Unexpected time");
        assert_eq!(decoded.echo_time, None, "Unexpected echo time");
        assert_eq!(
            &decoded.chunks[..6],
            &[0x18, 0x00, 0x03, 1, 2, 3],
            "Unexpected chunk bytes"
        );
    }

    #[test]
    fn packet_with_echo_time_round_trips() {
        let cipher = RtmfpCipher::new(DEFAULT_KEY).unwrap();
        let packet = init_packet_with_echo(
            MARKER_AMF,
            RtmfpTimestamp::new(100),
            RtmfpTimestamp::new(90),
        );

        let datagram = encode(&cipher, 55, packet).unwrap();
        let decoded = decode(&cipher, &datagram).unwrap();

        assert_eq!(decoded.session_id, 55, "Unexpected session id");
        assert_eq!(decoded.marker, MARKER_AMF | MARKER_ECHO_TIME, "Unexpected marker");
        assert_eq!(decoded.time, RtmfpTimestamp::new(100), "Unexpected time");
        assert_eq!(
            decoded.echo_time,
            Some(RtmfpTimestamp::new(90)),
            "Unexpected echo time"
        );
    }

    #[test]
    fn session_id_pack_unpack_round_trips() {
        let mut buffer = vec![0_u8; 16];
        buffer[4..8].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        buffer[8..12].copy_from_slice(&[0x01, 0x02, 0x03, 0x04]);

        pack_session_id(&mut buffer, 0xCAFEBABE);
        assert_eq!(unpack_session_id(&buffer), 0xCAFEBABE);
    }

    #[test]
    fn tampered_datagram_is_rejected_with_bad_crc() {
        let cipher = RtmfpCipher::new(&[9_u8; KEY_SIZE]).unwrap();
        let mut packet = init_packet(MARKER_RAW, RtmfpTimestamp::new(0));
        packet.extend_from_slice(&[0x51, 0x00, 0x01, 0xFF]);

        let mut datagram = encode(&cipher, 1, packet).unwrap();
        let last = datagram.len() - 1;
        datagram[last] ^= 0xA5;

        match decode(&cipher, &datagram) {
            Err(PacketDecodeError::BadCrc) => {}
            Err(x) => panic!("Expected BadCrc error, instead received {}", x),
            Ok(_) => panic!("Expected BadCrc error but the datagram decoded"),
        }
    }

    #[test]
    fn decoding_with_the_wrong_key_is_rejected() {
        let cipher = RtmfpCipher::new(&[1_u8; KEY_SIZE]).unwrap();
        let other = RtmfpCipher::new(&[2_u8; KEY_SIZE]).unwrap();
        let mut packet = init_packet(MARKER_RAW, RtmfpTimestamp::new(7));
        packet.extend_from_slice(&[0x01]);

        let datagram = encode(&cipher, 1, packet).unwrap();
        match decode(&other, &datagram) {
            Err(PacketDecodeError::BadCrc) => {}
            Err(x) => panic!("Expected BadCrc error, instead received {}", x),
            Ok(_) => panic!("Expected BadCrc error but the datagram decoded"),
        }
    }

    #[test]
    fn short_datagram_is_rejected() {
        let cipher = RtmfpCipher::new(DEFAULT_KEY).unwrap();
        match decode(&cipher, &[0_u8; 11]) {
            Err(PacketDecodeError::ShortPacket { size: 11 }) => {}
            Err(x) => panic!("Expected ShortPacket error, instead received {}", x),
            Ok(_) => panic!("Expected ShortPacket error but the datagram decoded"),
        }
    }

    #[test]
    fn oversized_packet_still_encodes() {
        let cipher = RtmfpCipher::new(DEFAULT_KEY).unwrap();
        let mut packet = init_packet(MARKER_RAW, RtmfpTimestamp::new(0));
        packet.resize(MAX_PACKET_SIZE + 1, 0x55);

        let datagram = encode(&cipher, 1, packet).unwrap();
        let decoded = decode(&cipher, &datagram).unwrap();
        assert_eq!(decoded.chunks[0], 0x55, "Unexpected first chunk byte");
        assert!(
            decoded.chunks.len() >= MAX_PACKET_SIZE + 1 - 9,
            "Decoded chunk bytes were truncated"
        );
    }
}
