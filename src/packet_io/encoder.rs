use byteorder::{BigEndian, WriteBytesExt};
use std::io::{Cursor, Write};
use tracing::warn;

use super::checksum::checksum;
use super::cipher::{RtmfpCipher, KEY_SIZE};
use super::errors::PacketEncodeError;
use super::{MARKER_ECHO_TIME, MAX_PACKET_SIZE};
use crate::time::RtmfpTimestamp;

/// Starts a new outbound packet: four reserved bytes for the packed session id, two reserved
/// bytes for the checksum, then the marker and time fields.  Chunk bytes are appended to the
/// returned buffer before it is sealed with [`encode`].
pub fn init_packet(marker: u8, time: RtmfpTimestamp) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::with_capacity(64));
    cursor.write_all(&[0_u8; 6]).expect("writing to a vec");
    cursor.write_u8(marker).expect("writing to a vec");
    cursor
        .write_u16::<BigEndian>(time.value)
        .expect("writing to a vec");

    cursor.into_inner()
}

/// Same as [`init_packet`] but with the peer's last time echoed back, which sets the echo
/// bit on the marker
pub fn init_packet_with_echo(marker: u8, time: RtmfpTimestamp, echo: RtmfpTimestamp) -> Vec<u8> {
    let mut packet = init_packet(marker | MARKER_ECHO_TIME, time);
    packet.extend_from_slice(&echo.value.to_be_bytes());
    packet
}

/// Writes the XOR-packed session id over the first four bytes of an encrypted datagram
pub fn pack_session_id(datagram: &mut [u8], far_id: u32) {
    let w1 = u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
    let w2 = u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);
    datagram[0..4].copy_from_slice(&(w1 ^ w2 ^ far_id).to_be_bytes());
}

/// Seals a packet started with [`init_packet`]: pads with 0xFF to the AES block size, writes
/// the checksum, encrypts everything past the session id and packs the session id in front.
///
/// Packets larger than the RTMFP maximum are emitted anyway; peers may ignore them.
pub fn encode(
    cipher: &RtmfpCipher,
    far_id: u32,
    mut packet: Vec<u8>,
) -> Result<Vec<u8>, PacketEncodeError> {
    if packet.len() > MAX_PACKET_SIZE {
        warn!(
            size = packet.len(),
            "Packet exceeds the {} byte RTMFP maximum and risks being ignored by the peer",
            MAX_PACKET_SIZE
        );
    }

    let padding = (KEY_SIZE - ((packet.len() - 4) % KEY_SIZE)) % KEY_SIZE;
    packet.resize(packet.len() + padding, 0xFF);

    let crc = checksum(&packet[6..]);
    packet[4..6].copy_from_slice(&crc.to_be_bytes());

    cipher.encrypt(&mut packet[4..]);
    pack_session_id(&mut packet, far_id);

    Ok(packet)
}
