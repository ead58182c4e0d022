//! Scalar and string (de)serialization for decoded frame payloads.
//!
//! Every multi-byte integer is big-endian; strings are
//! `[len: u32][bytes]`; booleans are a single byte. Unlike XDR, nothing
//! here is padded to a 4-byte boundary.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{Error, Result};

/// Maximum length accepted for a single length-prefixed string, guarding
/// against a corrupt or hostile length field allocating an unbounded
/// buffer.
pub const MAX_STRING_LEN: usize = 64 * 1024;

/// Reads a `u32` in network byte order.
pub fn read_u32(src: &mut impl Read) -> Result<u32> {
    src.read_u32::<BigEndian>().map_err(Error::Io)
}

/// Writes a `u32` in network byte order.
pub fn write_u32(dst: &mut impl Write, v: u32) -> Result<()> {
    dst.write_u32::<BigEndian>(v).map_err(Error::Io)
}

/// Reads a `u64` in network byte order.
pub fn read_u64(src: &mut impl Read) -> Result<u64> {
    src.read_u64::<BigEndian>().map_err(Error::Io)
}

/// Writes a `u64` in network byte order.
pub fn write_u64(dst: &mut impl Write, v: u64) -> Result<()> {
    dst.write_u64::<BigEndian>(v).map_err(Error::Io)
}

/// Reads an `i32` in network byte order.
pub fn read_i32(src: &mut impl Read) -> Result<i32> {
    src.read_i32::<BigEndian>().map_err(Error::Io)
}

/// Writes an `i32` in network byte order.
pub fn write_i32(dst: &mut impl Write, v: i32) -> Result<()> {
    dst.write_i32::<BigEndian>(v).map_err(Error::Io)
}

/// Reads a boolean encoded as a single byte (`0` or nonzero).
pub fn read_bool(src: &mut impl Read) -> Result<bool> {
    let mut buf = [0u8; 1];
    src.read_exact(&mut buf).map_err(Error::Io)?;
    Ok(buf[0] != 0)
}

/// Writes a boolean as a single byte.
pub fn write_bool(dst: &mut impl Write, v: bool) -> Result<()> {
    dst.write_u8(v as u8).map_err(Error::Io)
}

/// Reads a `[len: u32][bytes]` string, rejecting lengths over
/// [`MAX_STRING_LEN`].
pub fn read_string(src: &mut impl Read) -> Result<String> {
    let len = read_u32(src)? as usize;
    if len > MAX_STRING_LEN {
        return Err(Error::UnmarshalArgs);
    }
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf).map_err(Error::Io)?;
    String::from_utf8(buf).map_err(Error::InvalidString)
}

/// Writes a string as `[len: u32][bytes]`.
pub fn write_string(dst: &mut impl Write, s: &str) -> Result<()> {
    write_u32(dst, s.len() as u32)?;
    dst.write_all(s.as_bytes()).map_err(Error::Io)
}

/// Reads a `[len: u32][bytes]` opaque byte vector.
pub fn read_bytes(src: &mut impl Read) -> Result<Vec<u8>> {
    let len = read_u32(src)? as usize;
    if len > MAX_STRING_LEN {
        return Err(Error::UnmarshalArgs);
    }
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf).map_err(Error::Io)?;
    Ok(buf)
}

/// Writes an opaque byte vector as `[len: u32][bytes]`.
pub fn write_bytes(dst: &mut impl Write, b: &[u8]) -> Result<()> {
    write_u32(dst, b.len() as u32)?;
    dst.write_all(b).map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_u32() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0xdead_beef).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_u32(&mut cursor).unwrap(), 0xdead_beef);
    }

    #[test]
    fn round_trips_string() {
        let mut buf = Vec::new();
        write_string(&mut buf, "acquire").unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_string(&mut cursor).unwrap(), "acquire");
    }

    #[test]
    fn rejects_oversized_string_length() {
        let mut buf = Vec::new();
        write_u32(&mut buf, (MAX_STRING_LEN + 1) as u32).unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(matches!(read_string(&mut cursor), Err(Error::UnmarshalArgs)));
    }

    #[test]
    fn bool_round_trip() {
        let mut buf = Vec::new();
        write_bool(&mut buf, true).unwrap();
        write_bool(&mut buf, false).unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(read_bool(&mut cursor).unwrap());
        assert!(!read_bool(&mut cursor).unwrap());
    }
}
