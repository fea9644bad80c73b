use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use std::net::SocketAddr;

use super::errors::HandshakeError;
use super::keying::{PEER_ID_SIZE, TAG_SIZE};
use crate::messages::{
    read_address, read_u64_7bit, write_address, write_chunk, write_u64_7bit, AddressType,
    MessageSerializationError,
};

pub const HANDSHAKE_30: u8 = 0x30;
pub const HANDSHAKE_38: u8 = 0x38;
pub const HANDSHAKE_70: u8 = 0x70;
pub const HANDSHAKE_78: u8 = 0x78;
pub const HANDSHAKE_REDIRECTION: u8 = 0x71;

const EPD_URL_MARKER: u8 = 0x0A;
const EPD_PEER_ID_MARKER: u8 = 0x0F;

/// Endpoint discriminator of the first handshake round: either the rtmfp url of a server or
/// the peer id of a far peer for a rendezvous.
#[derive(Debug, PartialEq, Clone)]
pub enum Epd {
    Url(String),
    PeerId([u8; PEER_ID_SIZE]),
}

impl Epd {
    fn write(&self, body: &mut Vec<u8>) -> Result<(), MessageSerializationError> {
        match self {
            Epd::Url(url) => {
                write_u64_7bit(body, url.len() as u64 + 1)?;
                body.write_u8(EPD_URL_MARKER)?;
                body.write_all(url.as_bytes())?;
            }
            Epd::PeerId(peer_id) => {
                write_u64_7bit(body, PEER_ID_SIZE as u64 + 1)?;
                body.write_u8(EPD_PEER_ID_MARKER)?;
                body.write_all(peer_id)?;
            }
        }

        Ok(())
    }

    fn read(cursor: &mut Cursor<&[u8]>) -> Result<Epd, HandshakeError> {
        let length = read_u64_7bit(cursor)? as usize;
        if length == 0 {
            return Err(HandshakeError::MalformedEpd);
        }

        let marker = cursor.read_u8()?;
        let mut content = vec![0_u8; length - 1];
        cursor.read_exact(&mut content)?;

        match marker {
            EPD_URL_MARKER => Ok(Epd::Url(
                String::from_utf8(content).map_err(|_| HandshakeError::MalformedEpd)?,
            )),
            EPD_PEER_ID_MARKER => {
                if content.len() != PEER_ID_SIZE {
                    return Err(HandshakeError::MalformedEpd);
                }
                let mut peer_id = [0_u8; PEER_ID_SIZE];
                peer_id.copy_from_slice(&content);
                Ok(Epd::PeerId(peer_id))
            }
            _ => Err(HandshakeError::MalformedEpd),
        }
    }
}

/// First handshake round: the endpoint discriminator plus a 16 byte tag that routes the reply
#[derive(Debug, PartialEq, Clone)]
pub struct Handshake30 {
    pub epd: Epd,
    pub tag: [u8; TAG_SIZE],
}

impl Handshake30 {
    pub fn write(&self, packet: &mut Vec<u8>) -> Result<(), MessageSerializationError> {
        let mut body = Vec::new();
        self.epd.write(&mut body)?;
        body.extend_from_slice(&self.tag);
        write_chunk(packet, HANDSHAKE_30, &body)
    }

    pub fn parse(payload: &[u8]) -> Result<Handshake30, HandshakeError> {
        let mut cursor = Cursor::new(payload);
        let epd = Epd::read(&mut cursor)?;
        let tag = read_tag(&mut cursor)?;
        Ok(Handshake30 { epd, tag })
    }
}

/// Responder's first reply: the echoed tag, a cookie binding the second round, and the
/// responder's public key
#[derive(Debug, PartialEq, Clone)]
pub struct Handshake70 {
    pub tag: [u8; TAG_SIZE],
    pub cookie: Vec<u8>,
    pub far_key: Vec<u8>,
}

impl Handshake70 {
    pub fn write(&self, packet: &mut Vec<u8>) -> Result<(), MessageSerializationError> {
        let mut body = Vec::new();
        body.write_u8(TAG_SIZE as u8)?;
        body.extend_from_slice(&self.tag);
        body.write_u8(self.cookie.len() as u8)?;
        body.extend_from_slice(&self.cookie);
        write_u64_7bit(&mut body, self.far_key.len() as u64)?;
        body.extend_from_slice(&self.far_key);
        write_chunk(packet, HANDSHAKE_70, &body)
    }

    pub fn parse(payload: &[u8]) -> Result<Handshake70, HandshakeError> {
        let mut cursor = Cursor::new(payload);
        let tag_length = cursor.read_u8()? as usize;
        if tag_length != TAG_SIZE {
            return Err(HandshakeError::MalformedPacket);
        }
        let tag = read_tag(&mut cursor)?;

        let cookie_length = cursor.read_u8()? as usize;
        let mut cookie = vec![0_u8; cookie_length];
        cursor.read_exact(&mut cookie)?;

        let key_length = read_u64_7bit(&mut cursor)? as usize;
        let mut far_key = vec![0_u8; key_length];
        cursor.read_exact(&mut far_key)?;

        Ok(Handshake70 {
            tag,
            cookie,
            far_key,
        })
    }
}

/// Initiator's second round: its proposed session id, the echoed cookie, its public key,
/// its nonce and the certificate its peer id is derived from
#[derive(Debug, PartialEq, Clone)]
pub struct Handshake38 {
    pub session_id: u32,
    pub cookie: Vec<u8>,
    pub public_key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub certificate: Vec<u8>,
}

impl Handshake38 {
    pub fn write(&self, packet: &mut Vec<u8>) -> Result<(), MessageSerializationError> {
        let mut body = Vec::new();
        body.write_u32::<BigEndian>(self.session_id)?;
        body.write_u8(self.cookie.len() as u8)?;
        body.extend_from_slice(&self.cookie);
        write_u64_7bit(&mut body, self.public_key.len() as u64)?;
        body.extend_from_slice(&self.public_key);
        write_u64_7bit(&mut body, self.nonce.len() as u64)?;
        body.extend_from_slice(&self.nonce);
        write_u64_7bit(&mut body, self.certificate.len() as u64)?;
        body.extend_from_slice(&self.certificate);
        write_chunk(packet, HANDSHAKE_38, &body)
    }

    pub fn parse(payload: &[u8]) -> Result<Handshake38, HandshakeError> {
        let mut cursor = Cursor::new(payload);
        let session_id = cursor.read_u32::<BigEndian>()?;

        let cookie_length = cursor.read_u8()? as usize;
        let mut cookie = vec![0_u8; cookie_length];
        cursor.read_exact(&mut cookie)?;

        let public_key = read_block(&mut cursor)?;
        let nonce = read_block(&mut cursor)?;
        let certificate = read_block(&mut cursor)?;

        Ok(Handshake38 {
            session_id,
            cookie,
            public_key,
            nonce,
            certificate,
        })
    }
}

/// Responder's second round: its session id, public key and nonce; receiving it makes the
/// session fully keyed on both sides
#[derive(Debug, PartialEq, Clone)]
pub struct Handshake78 {
    pub session_id: u32,
    pub public_key: Vec<u8>,
    pub nonce: Vec<u8>,
}

impl Handshake78 {
    pub fn write(&self, packet: &mut Vec<u8>) -> Result<(), MessageSerializationError> {
        let mut body = Vec::new();
        body.write_u32::<BigEndian>(self.session_id)?;
        write_u64_7bit(&mut body, self.public_key.len() as u64)?;
        body.extend_from_slice(&self.public_key);
        write_u64_7bit(&mut body, self.nonce.len() as u64)?;
        body.extend_from_slice(&self.nonce);
        write_chunk(packet, HANDSHAKE_78, &body)
    }

    pub fn parse(payload: &[u8]) -> Result<Handshake78, HandshakeError> {
        let mut cursor = Cursor::new(payload);
        let session_id = cursor.read_u32::<BigEndian>()?;
        let public_key = read_block(&mut cursor)?;
        let nonce = read_block(&mut cursor)?;

        Ok(Handshake78 {
            session_id,
            public_key,
            nonce,
        })
    }
}

/// Rendezvous reply or server redirection: the echoed tag plus candidate addresses to try
#[derive(Debug, PartialEq, Clone)]
pub struct Redirection {
    pub tag: [u8; TAG_SIZE],
    pub addresses: Vec<(SocketAddr, AddressType)>,
}

impl Redirection {
    pub fn write(&self, packet: &mut Vec<u8>) -> Result<(), MessageSerializationError> {
        let mut body = Vec::new();
        body.write_u8(TAG_SIZE as u8)?;
        body.extend_from_slice(&self.tag);
        for (address, kind) in &self.addresses {
            write_address(&mut body, address, *kind)?;
        }
        write_chunk(packet, HANDSHAKE_REDIRECTION, &body)
    }

    pub fn parse(payload: &[u8]) -> Result<Redirection, HandshakeError> {
        let mut cursor = Cursor::new(payload);
        let tag_length = cursor.read_u8()? as usize;
        if tag_length != TAG_SIZE {
            return Err(HandshakeError::MalformedPacket);
        }
        let tag = read_tag(&mut cursor)?;

        let mut addresses = Vec::new();
        while (cursor.position() as usize) < payload.len() {
            addresses.push(read_address(&mut cursor)?);
        }

        Ok(Redirection { tag, addresses })
    }
}

fn read_tag(cursor: &mut Cursor<&[u8]>) -> Result<[u8; TAG_SIZE], HandshakeError> {
    let mut tag = [0_u8; TAG_SIZE];
    cursor.read_exact(&mut tag)?;
    Ok(tag)
}

fn read_block(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, HandshakeError> {
    let length = read_u64_7bit(cursor)? as usize;
    if length > 4096 {
        return Err(HandshakeError::MalformedPacket);
    }

    let mut block = vec![0_u8; length];
    cursor.read_exact(&mut block)?;
    Ok(block)
}
