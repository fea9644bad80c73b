use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Writes a 7-bit encoded integer: big-endian groups of seven bits where every byte except
/// the last has its high bit set.  Flow ids, stages and fragment counters are all carried in
/// this encoding.
pub fn write_u64_7bit<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    let mut shift = (size_of_7bit(value) - 1) * 7;
    while shift > 0 {
        writer.write_u8(0x80 | ((value >> shift) & 0x7F) as u8)?;
        shift -= 7;
    }

    writer.write_u8((value & 0x7F) as u8)
}

/// Reads a 7-bit encoded integer, accepting at most ten bytes
pub fn read_u64_7bit<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut value = 0_u64;
    for _ in 0..10 {
        let byte = reader.read_u8()?;
        if value >> 57 != 0 {
            break;
        }

        value = (value << 7) | (byte & 0x7F) as u64;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "7-bit encoded integer exceeds 64 bits",
    ))
}

/// Number of bytes the 7-bit encoding of `value` occupies
pub fn size_of_7bit(value: u64) -> usize {
    let mut size = 1;
    let mut remaining = value >> 7;
    while remaining > 0 {
        size += 1;
        remaining >>= 7;
    }

    size
}
