//! Cell encoding for data column families.
//!
//! Every data cell stored in a blob-keyed B-tree is one contiguous blob:
//! `[key_len(4 BE) | key | value]`. The page store's comparator only ever
//! looks at the `key_len + key` prefix (see [`crate::storage::btree::KeyInfo`]),
//! so the value bytes can be anything, including empty.

use crate::error::{Error, ErrorCode, Result};

/// Encode `(key, value)` into a single cell payload.
pub fn encode_cell(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut cell = Vec::with_capacity(4 + key.len() + value.len());
    cell.extend_from_slice(&(key.len() as u32).to_be_bytes());
    cell.extend_from_slice(key);
    cell.extend_from_slice(value);
    cell
}

/// Read the key length out of a cell payload's 4-byte prefix.
pub fn decode_cell_key_len(payload: &[u8]) -> Result<usize> {
    if payload.len() < 4 {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    let key_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if 4 + key_len > payload.len() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    Ok(key_len)
}

/// Split a cell payload into its `(key, value)` slices.
pub fn decode_cell(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    let key_len = decode_cell_key_len(payload)?;
    Ok((&payload[4..4 + key_len], &payload[4 + key_len..]))
}

/// Encode a TTL timestamp (milliseconds since the Unix epoch) big-endian.
pub fn encode_be64(ts: i64) -> [u8; 8] {
    ts.to_be_bytes()
}

/// Decode a big-endian TTL timestamp.
pub fn decode_be64(bytes: &[u8]) -> Result<i64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::new(ErrorCode::Corrupt))?;
    Ok(i64::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_key_and_value() {
        let cell = encode_cell(b"apple", b"50");
        let (key, value) = decode_cell(&cell).unwrap();
        assert_eq!(key, b"apple");
        assert_eq!(value, b"50");
    }

    #[test]
    fn round_trips_empty_value() {
        let cell = encode_cell(b"k", b"");
        let (key, value) = decode_cell(&cell).unwrap();
        assert_eq!(key, b"k");
        assert!(value.is_empty());
    }

    #[test]
    fn rejects_short_payload() {
        assert!(decode_cell_key_len(&[0, 0, 0]).is_err());
    }

    #[test]
    fn rejects_key_len_past_end() {
        let mut cell = vec![0u8, 0, 0, 10];
        cell.extend_from_slice(b"short");
        assert!(decode_cell(&cell).is_err());
    }

    #[test]
    fn be64_round_trips_including_negative() {
        for ts in [0i64, 1, -1, i64::MAX, i64::MIN] {
            assert_eq!(decode_be64(&encode_be64(ts)).unwrap(), ts);
        }
    }
}
