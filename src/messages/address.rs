use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::errors::{MessageDeserializationError, MessageSerializationError};

/// How a peer address was learned, carried in the low nibble of the address flags byte
#[derive(Debug, PartialEq, Eq, Copy, Clone, PartialOrd, Ord, Hash)]
pub enum AddressType {
    Unspecified,
    Local,
    Public,
    Redirection,
}

impl AddressType {
    pub fn from_flags(flags: u8) -> AddressType {
        match flags & 0x0F {
            1 => AddressType::Local,
            2 => AddressType::Public,
            3 => AddressType::Redirection,
            _ => AddressType::Unspecified,
        }
    }

    pub fn to_flags(self) -> u8 {
        match self {
            AddressType::Unspecified => 0,
            AddressType::Local => 1,
            AddressType::Public => 2,
            AddressType::Redirection => 3,
        }
    }
}

const FLAG_IPV6: u8 = 0x80;

/// Writes an address as `flags(u8) ipBytes(4|16) port(u16)`
pub fn write_address<W: Write>(
    writer: &mut W,
    address: &SocketAddr,
    kind: AddressType,
) -> Result<(), MessageSerializationError> {
    match address.ip() {
        IpAddr::V4(ip) => {
            writer.write_u8(kind.to_flags())?;
            writer.write_all(&ip.octets())?;
        }
        IpAddr::V6(ip) => {
            writer.write_u8(kind.to_flags() | FLAG_IPV6)?;
            writer.write_all(&ip.octets())?;
        }
    }

    writer.write_u16::<BigEndian>(address.port())?;
    Ok(())
}

/// Reads an address previously written with [`write_address`]
pub fn read_address<R: Read>(
    reader: &mut R,
) -> Result<(SocketAddr, AddressType), MessageDeserializationError> {
    let flags = reader.read_u8()?;
    let ip = if flags & FLAG_IPV6 != 0 {
        let mut octets = [0_u8; 16];
        reader.read_exact(&mut octets)?;
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        let mut octets = [0_u8; 4];
        reader.read_exact(&mut octets)?;
        IpAddr::V4(Ipv4Addr::from(octets))
    };

    let port = reader.read_u16::<BigEndian>()?;
    Ok((SocketAddr::new(ip, port), AddressType::from_flags(flags)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn ipv4_address_round_trips() {
        let address: SocketAddr = "192.168.1.10:1935".parse().unwrap();
        let mut bytes = Vec::new();
        write_address(&mut bytes, &address, AddressType::Public).unwrap();

        assert_eq!(bytes[0], 2, "Unexpected flags byte");
        assert_eq!(bytes.len(), 7, "Unexpected encoded length");

        let (read, kind) = read_address(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(read, address, "Address did not round trip");
        assert_eq!(kind, AddressType::Public, "Unexpected address type");
    }

    #[test]
    fn ipv6_address_round_trips() {
        let address: SocketAddr = "[2001:db8::1]:19350".parse().unwrap();
        let mut bytes = Vec::new();
        write_address(&mut bytes, &address, AddressType::Local).unwrap();

        assert_eq!(bytes[0], 1 | 0x80, "Unexpected flags byte");
        assert_eq!(bytes.len(), 19, "Unexpected encoded length");

        let (read, kind) = read_address(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(read, address, "Address did not round trip");
        assert_eq!(kind, AddressType::Local, "Unexpected address type");
    }

    #[test]
    fn unknown_nibble_reads_as_unspecified() {
        assert_eq!(AddressType::from_flags(0x0C), AddressType::Unspecified);
    }
}
