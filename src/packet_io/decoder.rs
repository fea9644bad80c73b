use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;

use super::checksum::checksum;
use super::cipher::RtmfpCipher;
use super::errors::PacketDecodeError;
use super::{MARKER_ECHO_TIME, MIN_PACKET_SIZE};
use crate::time::RtmfpTimestamp;

/// A decrypted and checksum-verified RTMFP packet
#[derive(Debug, PartialEq)]
pub struct DecodedPacket {
    /// The session id recovered from the XOR-packed first word
    pub session_id: u32,

    /// Packet marker (0x0B handshake, 0x09 raw, 0x89 AMF, +4 when an echo time is present)
    pub marker: u8,

    /// The sender's clock at emission time
    pub time: RtmfpTimestamp,

    /// Our own time echoed back by the peer, used for round trip estimation
    pub echo_time: Option<RtmfpTimestamp>,

    /// The chunk bytes following the header, including any trailing 0xFF padding
    pub chunks: Vec<u8>,
}

/// Recovers the session id from the first twelve bytes of a datagram without decrypting it:
/// the first word XORed with the two words that follow it.
pub fn unpack_session_id(datagram: &[u8]) -> u32 {
    let mut id = 0_u32;
    for word in datagram.chunks_exact(4).take(3) {
        id ^= u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
    }

    id
}

/// Decrypts a datagram, verifies its checksum and parses the packet header.
///
/// Errors signal datagrams that must be dropped silently; none of them is fatal for the
/// session the datagram was addressed to.
pub fn decode(cipher: &RtmfpCipher, datagram: &[u8]) -> Result<DecodedPacket, PacketDecodeError> {
    if datagram.len() < MIN_PACKET_SIZE {
        return Err(PacketDecodeError::ShortPacket {
            size: datagram.len(),
        });
    }

    let session_id = unpack_session_id(datagram);

    let mut plaintext = datagram[4..].to_vec();
    cipher.decrypt(&mut plaintext)?;

    let mut cursor = Cursor::new(plaintext);
    let crc = cursor
        .read_u16::<BigEndian>()
        .map_err(|_| PacketDecodeError::BadCrc)?;
    let body_start = cursor.position() as usize;
    if checksum(&cursor.get_ref()[body_start..]) != crc {
        return Err(PacketDecodeError::BadCrc);
    }

    let marker = cursor.read_u8().map_err(|_| PacketDecodeError::BadCrc)?;
    let time = RtmfpTimestamp::new(
        cursor
            .read_u16::<BigEndian>()
            .map_err(|_| PacketDecodeError::BadCrc)?,
    );

    let echo_time = if marker & MARKER_ECHO_TIME != 0 {
        Some(RtmfpTimestamp::new(
            cursor
                .read_u16::<BigEndian>()
                .map_err(|_| PacketDecodeError::BadCrc)?,
        ))
    } else {
        None
    };

    let chunk_start = cursor.position() as usize;
    let chunks = cursor.into_inner().split_off(chunk_start);

    Ok(DecodedPacket {
        session_id,
        marker,
        time,
        echo_time,
        chunks,
    })
}
