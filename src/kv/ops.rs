//! Point operations: `put`, `put_ttl`, `get`, `exists`, `delete`.
//!
//! Blob-keyed tables don't auto-dedupe on insert the way an intkey table
//! does (there is no "same rowid" to collide on), so every write here seeks
//! first and explicitly deletes a matching cell before re-inserting.

use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::btree::{Btree, BtreeInsertFlags, BtreePayload};

use super::cf::CfHandle;
use super::codec::{decode_cell, encode_cell};
use super::cursor::{alloc_cursor, seek_blob};
use super::ttl;
use super::{MAX_KEY_LEN, MAX_VALUE_LEN};

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::with_message(
            ErrorCode::Error,
            format!("key must be 1..={MAX_KEY_LEN} bytes"),
        ));
    }
    Ok(())
}

fn validate_value(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_LEN {
        return Err(Error::with_message(
            ErrorCode::Error,
            format!("value must be at most {MAX_VALUE_LEN} bytes"),
        ));
    }
    Ok(())
}

/// Insert or overwrite `key` with `value`, clearing any TTL the key
/// previously carried.
pub fn put(btree: &Arc<Btree>, cf: &CfHandle, key: &[u8], value: &[u8]) -> Result<()> {
    validate_key(key)?;
    validate_value(value)?;
    let _guard = cf.lock();
    if cf.has_ttl() {
        ttl::clear_ttl(btree, cf, key)?;
    }
    upsert_cell(btree, cf, key, value)
}

/// Insert or overwrite `key` with `value`, expiring it at `expires_at_ms`
/// (milliseconds since the Unix epoch).
pub fn put_ttl(btree: &Arc<Btree>, cf: &CfHandle, key: &[u8], value: &[u8], expires_at_ms: i64) -> Result<()> {
    validate_key(key)?;
    validate_value(value)?;
    let _guard = cf.lock();
    ttl::set_ttl(btree, cf, key, expires_at_ms)?;
    upsert_cell(btree, cf, key, value)
}

fn upsert_cell(btree: &Arc<Btree>, cf: &CfHandle, key: &[u8], value: &[u8]) -> Result<()> {
    cf.invalidate_cursor();
    let mut cursor = alloc_cursor(btree, cf.root_page, true, cf.key_info.clone())?;
    if seek_blob(&mut cursor, key)? {
        btree.delete(&mut cursor, BtreeInsertFlags::empty())?;
        seek_blob(&mut cursor, key)?;
    }
    let cell = encode_cell(key, value);
    let payload = BtreePayload {
        key: Some(cell),
        n_key: 0,
        data: None,
        mem: Vec::new(),
        n_data: 0,
        n_zero: 0,
    };
    btree.insert(&mut cursor, &payload, BtreeInsertFlags::empty(), 0)
}

/// Fetch `key`'s value, lazily purging it (and reporting `None`) if its TTL
/// has already elapsed.
pub fn get(btree: &Arc<Btree>, cf: &CfHandle, key: &[u8]) -> Result<Option<Vec<u8>>> {
    validate_key(key)?;
    let _guard = cf.lock();
    if cf.has_ttl() && ttl::is_expired(btree, cf, key)? {
        return Ok(None);
    }
    read_cell(btree, cf, key)
}

/// Report whether `key` is present, without paying for the value payload
/// beyond its length. Read-only variant of `get`: unlike `get`, this never
/// checks or acts on TTL — callers who care about expiry use
/// `ttl_remaining`.
pub fn exists(btree: &Arc<Btree>, cf: &CfHandle, key: &[u8]) -> Result<bool> {
    validate_key(key)?;
    let _guard = cf.lock();
    let mut cursor = match cf.take_cursor() {
        Some(cursor) => cursor,
        None => alloc_cursor(btree, cf.root_page, false, cf.key_info.clone())?,
    };
    let found = seek_blob(&mut cursor, key)?;
    cf.park_cursor(cursor);
    Ok(found)
}

fn read_cell(btree: &Arc<Btree>, cf: &CfHandle, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut cursor = match cf.take_cursor() {
        Some(cursor) => cursor,
        None => alloc_cursor(btree, cf.root_page, false, cf.key_info.clone())?,
    };
    if !seek_blob(&mut cursor, key)? {
        cf.park_cursor(cursor);
        return Ok(None);
    }
    let size = cursor.payload_size();
    let payload = cursor.payload(0, size)?;
    let (_stored_key, value) = decode_cell(&payload)?;
    let value = value.to_vec();
    cf.park_cursor(cursor);
    Ok(Some(value))
}

/// Remove `key` (and any TTL entry it carries). Returns `true` if the key
/// was present.
pub fn delete(btree: &Arc<Btree>, cf: &CfHandle, key: &[u8]) -> Result<bool> {
    validate_key(key)?;
    let _guard = cf.lock();
    if cf.has_ttl() {
        ttl::clear_ttl(btree, cf, key)?;
    }
    delete_cell_only(btree, cf, key)
}

/// Remove `key` from the data table without touching its TTL bookkeeping.
/// Used by [`super::ttl::purge_expired`], which manages the TTL indexes
/// itself as part of its own sweep.
pub(crate) fn delete_cell_only(btree: &Arc<Btree>, cf: &CfHandle, key: &[u8]) -> Result<bool> {
    cf.invalidate_cursor();
    let mut cursor = alloc_cursor(btree, cf.root_page, true, cf.key_info.clone())?;
    if !seek_blob(&mut cursor, key)? {
        return Ok(false);
    }
    btree.delete(&mut cursor, BtreeInsertFlags::empty())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::catalog::open_or_create_default_cf;
    use crate::os::unix::UnixVfs;
    use crate::storage::btree::BtreeOpenFlags;
    use crate::types::OpenFlags;
    use std::sync::Arc as StdArc;

    fn memory_btree() -> Arc<Btree> {
        let vfs = UnixVfs::new();
        Btree::open(
            &vfs,
            ":memory:",
            None,
            BtreeOpenFlags::MEMORY,
            OpenFlags::CREATE | OpenFlags::READWRITE,
        )
        .unwrap()
    }

    fn default_cf(btree: &Arc<Btree>) -> StdArc<CfHandle> {
        btree.begin_trans(true).unwrap();
        let (root, _meta) = open_or_create_default_cf(btree).unwrap();
        btree.commit().unwrap();
        CfHandle::new("default".to_string(), root, None)
    }

    #[test]
    fn put_then_get_round_trips() {
        let btree = memory_btree();
        let cf = default_cf(&btree);
        btree.begin_trans(true).unwrap();
        put(&btree, &cf, b"k1", b"v1").unwrap();
        btree.commit().unwrap();

        btree.begin_trans(false).unwrap();
        assert_eq!(get(&btree, &cf, b"k1").unwrap(), Some(b"v1".to_vec()));
        assert!(exists(&btree, &cf, b"k1").unwrap());
        assert_eq!(get(&btree, &cf, b"missing").unwrap(), None);
        btree.rollback(0, false).unwrap();
    }

    #[test]
    fn put_overwrites_existing_value() {
        let btree = memory_btree();
        let cf = default_cf(&btree);
        btree.begin_trans(true).unwrap();
        put(&btree, &cf, b"k1", b"v1").unwrap();
        put(&btree, &cf, b"k1", b"v2").unwrap();
        btree.commit().unwrap();

        btree.begin_trans(false).unwrap();
        assert_eq!(get(&btree, &cf, b"k1").unwrap(), Some(b"v2".to_vec()));
        btree.rollback(0, false).unwrap();
    }

    #[test]
    fn delete_removes_key() {
        let btree = memory_btree();
        let cf = default_cf(&btree);
        btree.begin_trans(true).unwrap();
        put(&btree, &cf, b"k1", b"v1").unwrap();
        assert!(delete(&btree, &cf, b"k1").unwrap());
        assert!(!delete(&btree, &cf, b"k1").unwrap());
        btree.commit().unwrap();

        btree.begin_trans(false).unwrap();
        assert_eq!(get(&btree, &cf, b"k1").unwrap(), None);
        btree.rollback(0, false).unwrap();
    }

    #[test]
    fn rejects_oversized_key_and_value() {
        let btree = memory_btree();
        let cf = default_cf(&btree);
        btree.begin_trans(true).unwrap();
        assert!(put(&btree, &cf, b"", b"v").is_err());
        let huge_key = vec![0u8; MAX_KEY_LEN + 1];
        assert!(put(&btree, &cf, &huge_key, b"v").is_err());
        btree.commit().unwrap();
    }

    #[test]
    fn repeated_lookups_reuse_the_cached_read_cursor() {
        let btree = memory_btree();
        let cf = default_cf(&btree);
        btree.begin_trans(true).unwrap();
        put(&btree, &cf, b"k1", b"v1").unwrap();
        btree.commit().unwrap();

        btree.begin_trans(false).unwrap();
        assert!(cf.take_cursor().is_none());
        assert_eq!(get(&btree, &cf, b"k1").unwrap(), Some(b"v1".to_vec()));
        let cursor = cf.take_cursor();
        assert!(cursor.is_some());
        cf.park_cursor(cursor.unwrap());
        assert!(exists(&btree, &cf, b"k1").unwrap());
        btree.rollback(0, false).unwrap();
    }

    #[test]
    fn a_write_invalidates_the_parked_read_cursor() {
        let btree = memory_btree();
        let cf = default_cf(&btree);
        btree.begin_trans(true).unwrap();
        put(&btree, &cf, b"k1", b"v1").unwrap();
        assert_eq!(get(&btree, &cf, b"k1").unwrap(), Some(b"v1".to_vec()));
        let parked = cf.take_cursor();
        assert!(parked.is_some());
        cf.park_cursor(parked.unwrap());

        put(&btree, &cf, b"k2", b"v2").unwrap();
        assert!(cf.take_cursor().is_none());
        btree.commit().unwrap();
    }

    #[test]
    fn many_keys_survive_btree_rebalancing() {
        let btree = memory_btree();
        let cf = default_cf(&btree);
        btree.begin_trans(true).unwrap();
        for i in 0..500u32 {
            let key = format!("key-{i:05}");
            put(&btree, &cf, key.as_bytes(), b"v").unwrap();
        }
        btree.commit().unwrap();

        btree.begin_trans(false).unwrap();
        for i in 0..500u32 {
            let key = format!("key-{i:05}");
            assert_eq!(get(&btree, &cf, key.as_bytes()).unwrap(), Some(b"v".to_vec()));
        }
        btree.rollback(0, false).unwrap();
    }
}
