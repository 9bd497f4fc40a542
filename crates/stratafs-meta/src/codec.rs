//! Binary codec for attribute maps
//!
//! Sidecar and index files hold one MessagePack map of string keys to raw
//! byte values:
//!
//! ```text
//! +-----------+----------------------+
//! | map<N>    | N x ( str | bin )    |
//! | header    |   key     value      |
//! +-----------+----------------------+
//! ```
//!
//! The encoder always writes `str` keys and `bin` values. The decoder
//! tolerates any valid encoding a prior writer produced: keys as `str` or
//! `bin`, values as `bin`, `str` or `nil`. An empty input decodes to an
//! empty map.

use rmp::decode::{self, ValueReadError};
use rmp::encode::{self, ValueWriteError};
use rmp::Marker;
use std::io::Read;
use stratafs_common::{AttrMap, Error, Result};

/// Encode an attribute map into a MessagePack byte sequence.
pub fn encode(attribs: &AttrMap) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(estimate_size(attribs));

    encode::write_map_len(&mut buf, attribs.len() as u32).map_err(write_error)?;
    for (key, val) in attribs {
        encode::write_str(&mut buf, key).map_err(write_error)?;
        encode::write_bin(&mut buf, val).map_err(write_error)?;
    }
    Ok(buf)
}

/// Decode a MessagePack byte sequence into an attribute map.
///
/// An empty input is an empty map, not an error.
pub fn decode(bytes: &[u8]) -> Result<AttrMap> {
    if bytes.is_empty() {
        return Ok(AttrMap::new());
    }

    let mut rd = bytes;
    let len = decode::read_map_len(&mut rd).map_err(read_error)?;

    let mut attribs = AttrMap::with_capacity(len as usize);
    for _ in 0..len {
        let key_bytes = read_blob(&mut rd)?;
        let key = String::from_utf8(key_bytes)
            .map_err(|_| Error::codec("map key is not valid UTF-8"))?;
        let val = read_blob(&mut rd)?;
        attribs.insert(key, val);
    }
    Ok(attribs)
}

/// Read one string, binary or nil value as raw bytes.
fn read_blob(rd: &mut &[u8]) -> Result<Vec<u8>> {
    let marker = decode::read_marker(rd).map_err(|e| read_error(ValueReadError::from(e)))?;
    let len = match marker {
        Marker::FixStr(n) => n as usize,
        Marker::Str8 | Marker::Bin8 => read_len(rd, 1)?,
        Marker::Str16 | Marker::Bin16 => read_len(rd, 2)?,
        Marker::Str32 | Marker::Bin32 => read_len(rd, 4)?,
        Marker::Null => return Ok(Vec::new()),
        other => {
            return Err(Error::codec(format!(
                "unexpected marker {:?}, expected str or bin",
                other
            )))
        }
    };

    let mut data = vec![0u8; len];
    rd.read_exact(&mut data)
        .map_err(|_| Error::codec("input truncated inside str/bin payload"))?;
    Ok(data)
}

/// Read a big-endian length field of `width` bytes.
fn read_len(rd: &mut &[u8], width: usize) -> Result<usize> {
    let mut buf = [0u8; 4];
    rd.read_exact(&mut buf[..width])
        .map_err(|_| Error::codec("input truncated inside length field"))?;
    let mut len = 0usize;
    for b in &buf[..width] {
        len = (len << 8) | *b as usize;
    }
    Ok(len)
}

fn estimate_size(attribs: &AttrMap) -> usize {
    // map header + per-entry headers are small; 8 bytes each is plenty
    attribs
        .iter()
        .map(|(k, v)| k.len() + v.len() + 8)
        .sum::<usize>()
        + 8
}

fn read_error(err: ValueReadError) -> Error {
    match err {
        ValueReadError::TypeMismatch(marker) => Error::codec(format!(
            "unexpected marker {:?}, expected a map header",
            marker
        )),
        ValueReadError::InvalidMarkerRead(e) | ValueReadError::InvalidDataRead(e) => {
            Error::codec(format!("truncated input: {}", e))
        }
    }
}

fn write_error(err: ValueWriteError) -> Error {
    match err {
        ValueWriteError::InvalidMarkerWrite(e) | ValueWriteError::InvalidDataWrite(e) => {
            Error::codec(format!("write failed: {}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut attribs = AttrMap::new();
        attribs.insert("user.space_id".into(), b"s1".to_vec());
        attribs.insert("user.grant.alice".into(), b"r".to_vec());
        attribs.insert("user.empty".into(), Vec::new());
        attribs.insert("user.binary".into(), vec![0, 159, 146, 150]);

        let encoded = encode(&attribs).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, attribs);
    }

    #[test]
    fn test_empty_input_is_empty_map() {
        assert_eq!(decode(&[]).unwrap(), AttrMap::new());
    }

    #[test]
    fn test_empty_map_round_trip() {
        let encoded = encode(&AttrMap::new()).unwrap();
        assert_eq!(decode(&encoded).unwrap(), AttrMap::new());
    }

    #[test]
    fn test_tolerates_str_values() {
        // Writers that encode values as str instead of bin
        let mut buf = Vec::new();
        rmp::encode::write_map_len(&mut buf, 1).unwrap();
        rmp::encode::write_str(&mut buf, "user.grant.alice").unwrap();
        rmp::encode::write_str(&mut buf, "rw").unwrap();

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded["user.grant.alice"], b"rw".to_vec());
    }

    #[test]
    fn test_tolerates_nil_values() {
        let mut buf = Vec::new();
        rmp::encode::write_map_len(&mut buf, 1).unwrap();
        rmp::encode::write_str(&mut buf, "user.tombstone").unwrap();
        rmp::encode::write_nil(&mut buf).unwrap();

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded["user.tombstone"], Vec::<u8>::new());
    }

    #[test]
    fn test_rejects_non_map_input() {
        let mut buf = Vec::new();
        rmp::encode::write_str(&mut buf, "not a map").unwrap();
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn test_rejects_truncated_input() {
        let mut attribs = AttrMap::new();
        attribs.insert("user.k".into(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let encoded = encode(&attribs).unwrap();
        assert!(decode(&encoded[..encoded.len() - 3]).is_err());
    }

    #[test]
    fn test_large_value_uses_wide_length_field() {
        let mut attribs = AttrMap::new();
        attribs.insert("user.blob".into(), vec![0xAB; 70_000]);
        let encoded = encode(&attribs).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded["user.blob"].len(), 70_000);
    }
}
