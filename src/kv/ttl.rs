//! Time-to-live bookkeeping: two reserved tables per TTL-enabled column
//! family, `key -> expiry` for lazy lookup on `get`/`exists` and
//! `expiry || key -> key` ordered for a bounded sweep on `purge_expired`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::storage::btree::{Btree, BtreeCursorFlags, BtreeInsertFlags, BtreePayload, BTREE_BLOBKEY};
use crate::types::Pgno;
use crate::util::general::{log_message, LogLevel};

use super::catalog;
use super::cf::{ttl_expiry_index_name, ttl_key_index_name, CfHandle, TtlIndex};
use super::codec::{decode_be64, decode_cell, encode_be64, encode_cell};
use super::cursor::{alloc_cursor, seek_blob};
use super::ops;

/// Milliseconds since the Unix epoch, clamped to zero if the clock is
/// somehow set before it.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Create (or, on reopen, locate) the two reserved tables backing TTL
/// bookkeeping for `cf_name`. Must run inside a write transaction the first
/// time a given CF turns TTL tracking on.
pub fn ensure_ttl_cfs(btree: &Arc<Btree>, meta_root: Pgno, cf_name: &str) -> Result<TtlIndex> {
    let key_name = ttl_key_index_name(cf_name);
    let expiry_name = ttl_expiry_index_name(cf_name);

    let key_to_expiry_root = match catalog::open_cf(btree, meta_root, &key_name) {
        Ok(root) => root,
        Err(_) => catalog::create_cf(btree, meta_root, &key_name)?,
    };
    let expiry_to_key_root = match catalog::open_cf(btree, meta_root, &expiry_name) {
        Ok(root) => root,
        Err(_) => catalog::create_cf(btree, meta_root, &expiry_name)?,
    };

    Ok(TtlIndex {
        key_to_expiry_root,
        expiry_to_key_root,
    })
}

fn composite_key(expires_at_ms: i64, key: &[u8]) -> Vec<u8> {
    let mut composite = Vec::with_capacity(8 + key.len());
    composite.extend_from_slice(&encode_be64(expires_at_ms));
    composite.extend_from_slice(key);
    composite
}

/// Read the absolute expiry timestamp recorded for `key`, if any. Reuses
/// `cf`'s cached TTL read cursor across calls, the same way `ops::get`
/// reuses the cached data-CF cursor.
fn lookup_expiry(btree: &Arc<Btree>, cf: &CfHandle, key: &[u8]) -> Result<Option<i64>> {
    let ttl = cf.ttl().expect("caller checks cf.has_ttl() first");
    let mut cursor = match cf.take_ttl_cursor() {
        Some(cursor) => cursor,
        None => alloc_cursor(btree, ttl.key_to_expiry_root, false, cf.key_info.clone())?,
    };
    if !seek_blob(&mut cursor, key)? {
        cf.park_ttl_cursor(cursor);
        return Ok(None);
    }
    let size = cursor.payload_size();
    let payload = cursor.payload(0, size)?;
    let (_k, value) = decode_cell(&payload)?;
    let expiry = decode_be64(value)?;
    cf.park_ttl_cursor(cursor);
    Ok(Some(expiry))
}

/// Record `key`'s expiry, replacing any existing one. `expires_at_ms == 0`
/// clears the TTL entirely, leaving the key present with no expiry.
pub fn set_ttl(btree: &Arc<Btree>, cf: &CfHandle, key: &[u8], expires_at_ms: i64) -> Result<()> {
    let ttl = cf
        .ttl()
        .ok_or_else(|| crate::error::Error::new(crate::error::ErrorCode::Error))?;
    clear_ttl(btree, cf, key)?;

    if expires_at_ms <= 0 {
        return Ok(());
    }

    cf.invalidate_cursor();
    let mut key_cursor = alloc_cursor(btree, ttl.key_to_expiry_root, true, cf.key_info.clone())?;
    seek_blob(&mut key_cursor, key)?;
    let key_cell = encode_cell(key, &encode_be64(expires_at_ms));
    btree.insert(
        &mut key_cursor,
        &BtreePayload {
            key: Some(key_cell),
            n_key: 0,
            data: None,
            mem: Vec::new(),
            n_data: 0,
            n_zero: 0,
        },
        BtreeInsertFlags::empty(),
        0,
    )?;

    let composite = composite_key(expires_at_ms, key);
    let mut expiry_cursor = alloc_cursor(btree, ttl.expiry_to_key_root, true, cf.key_info.clone())?;
    seek_blob(&mut expiry_cursor, &composite)?;
    let expiry_cell = encode_cell(&composite, key);
    btree.insert(
        &mut expiry_cursor,
        &BtreePayload {
            key: Some(expiry_cell),
            n_key: 0,
            data: None,
            mem: Vec::new(),
            n_data: 0,
            n_zero: 0,
        },
        BtreeInsertFlags::empty(),
        0,
    )
}

/// Remove any TTL entry recorded for `key`. A no-op if the key carries none.
pub fn clear_ttl(btree: &Arc<Btree>, cf: &CfHandle, key: &[u8]) -> Result<()> {
    let Some(ttl) = cf.ttl() else {
        return Ok(());
    };
    let Some(expires_at_ms) = lookup_expiry(btree, cf, key)? else {
        return Ok(());
    };

    cf.invalidate_cursor();
    let mut key_cursor = alloc_cursor(btree, ttl.key_to_expiry_root, true, cf.key_info.clone())?;
    if seek_blob(&mut key_cursor, key)? {
        btree.delete(&mut key_cursor, BtreeInsertFlags::empty())?;
    }

    let composite = composite_key(expires_at_ms, key);
    let mut expiry_cursor = alloc_cursor(btree, ttl.expiry_to_key_root, true, cf.key_info.clone())?;
    if seek_blob(&mut expiry_cursor, &composite)? {
        btree.delete(&mut expiry_cursor, BtreeInsertFlags::empty())?;
    }
    Ok(())
}

/// Whether `key`'s TTL (if any) has already elapsed, as of `now_ms()`.
pub fn is_expired(btree: &Arc<Btree>, cf: &CfHandle, key: &[u8]) -> Result<bool> {
    if !cf.has_ttl() {
        return Ok(false);
    }
    match lookup_expiry(btree, cf, key)? {
        Some(expiry) => Ok(expiry <= now_ms()),
        None => Ok(false),
    }
}

/// Milliseconds remaining before `key` expires, or [`super::NO_TTL`] if the
/// key carries none. Already-elapsed TTLs report `0`, not negative.
pub fn ttl_remaining(btree: &Arc<Btree>, cf: &CfHandle, key: &[u8]) -> Result<i64> {
    if !cf.has_ttl() {
        return Ok(super::NO_TTL);
    }
    match lookup_expiry(btree, cf, key)? {
        Some(expiry) => Ok((expiry - now_ms()).max(0)),
        None => Ok(super::NO_TTL),
    }
}

/// Sweep every entry whose expiry is at or before `now_ms`, deleting it from
/// the data table as well as both TTL indexes. Runs as two passes: a
/// read-only scan to collect candidate keys (bounded by `limit`), then one
/// write transaction applying the deletes. Returns the number purged.
pub fn purge_expired(btree: &Arc<Btree>, cf: &CfHandle, now: i64, limit: usize) -> Result<u64> {
    let _guard = cf.lock();
    let Some(ttl) = cf.ttl() else {
        return Ok(0);
    };

    let mut expired_keys = Vec::new();
    {
        let mut cursor = alloc_cursor(btree, ttl.expiry_to_key_root, false, cf.key_info.clone())?;
        if !cursor.first()? {
            loop {
                if cursor.eof() || expired_keys.len() >= limit {
                    break;
                }
                let size = cursor.payload_size();
                let payload = cursor.payload(0, size)?;
                let (composite, user_key) = decode_cell(&payload)?;
                let expiry = decode_be64(&composite[..8])?;
                if expiry > now {
                    break;
                }
                expired_keys.push(user_key.to_vec());
                cursor.next(0)?;
            }
        }
    }

    if expired_keys.is_empty() {
        return Ok(0);
    }

    for key in &expired_keys {
        ops::delete_cell_only(btree, cf, key)?;
        clear_ttl(btree, cf, key)?;
    }

    log_message(
        LogLevel::Notice,
        &format!("purged {} expired key(s) from column family '{}'", expired_keys.len(), cf.name),
    );

    Ok(expired_keys.len() as u64)
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

    fn ttl_cf(btree: &Arc<Btree>) -> StdArc<CfHandle> {
        btree.begin_trans(true).unwrap();
        let (root, meta_root) = open_or_create_default_cf(btree).unwrap();
        let index = ensure_ttl_cfs(btree, meta_root, "default").unwrap();
        btree.commit().unwrap();
        let mut handle = CfHandle::new("default".to_string(), root, None);
        StdArc::get_mut(&mut handle).unwrap().attach_ttl(index);
        handle
    }

    #[test]
    fn set_then_lookup_then_clear() {
        let btree = memory_btree();
        let cf = ttl_cf(&btree);
        btree.begin_trans(true).unwrap();
        ops::put_ttl(&btree, &cf, b"k1", b"v1", now_ms() + 60_000).unwrap();
        assert!(!is_expired(&btree, &cf, b"k1").unwrap());
        assert!(ttl_remaining(&btree, &cf, b"k1").unwrap() > 0);
        ops::delete(&btree, &cf, b"k1").unwrap();
        assert_eq!(ttl_remaining(&btree, &cf, b"k1").unwrap(), super::super::NO_TTL);
        btree.commit().unwrap();
    }

    #[test]
    fn put_ttl_with_zero_expiry_writes_the_key_without_a_ttl() {
        let btree = memory_btree();
        let cf = ttl_cf(&btree);
        btree.begin_trans(true).unwrap();
        ops::put_ttl(&btree, &cf, b"k1", b"v1", now_ms() + 60_000).unwrap();
        ops::put_ttl(&btree, &cf, b"k1", b"v2", 0).unwrap();
        assert_eq!(ttl_remaining(&btree, &cf, b"k1").unwrap(), super::super::NO_TTL);
        assert!(!is_expired(&btree, &cf, b"k1").unwrap());
        assert_eq!(ops::get(&btree, &cf, b"k1").unwrap(), Some(b"v2".to_vec()));
        btree.commit().unwrap();
    }

    #[test]
    fn purge_removes_elapsed_entries_only() {
        let btree = memory_btree();
        let cf = ttl_cf(&btree);
        btree.begin_trans(true).unwrap();
        ops::put_ttl(&btree, &cf, b"expired", b"v", 1).unwrap();
        ops::put_ttl(&btree, &cf, b"fresh", b"v", now_ms() + 60_000).unwrap();
        let purged = purge_expired(&btree, &cf, now_ms(), 100).unwrap();
        assert_eq!(purged, 1);
        assert_eq!(ops::get(&btree, &cf, b"expired").unwrap(), None);
        assert_eq!(ops::get(&btree, &cf, b"fresh").unwrap(), Some(b"v".to_vec()));
        btree.commit().unwrap();
    }
}
