//! Forward iteration over a column family's data table, with an optional
//! key-prefix filter.
//!
//! `BtCursor::restore()` doesn't re-seek a blob-keyed cursor after a
//! concurrent write invalidates it; it just invalidates. So a `CfIterator`
//! that observes `eof()` unexpectedly mid-scan after some other writer ran
//! is expected to be closed and reopened by the caller, not resumed.

use std::sync::Arc;

use crate::error::Result;
use crate::storage::btree::{Btree, BtCursor, UnpackedRecord};

use super::cf::CfHandle;
use super::codec::decode_cell;
use super::cursor::alloc_cursor;

/// A live forward scan over one column family, optionally restricted to
/// keys sharing a prefix.
pub struct CfIterator {
    cursor: BtCursor,
    prefix: Option<Vec<u8>>,
    started: bool,
    done: bool,
}

impl CfIterator {
    /// Open an iterator over `cf`. When `prefix` is `Some`, only keys that
    /// start with it are visited.
    pub fn open(btree: &Arc<Btree>, cf: &CfHandle, prefix: Option<Vec<u8>>) -> Result<Self> {
        let cursor = alloc_cursor(btree, cf.root_page, false, cf.key_info.clone())?;
        Ok(Self {
            cursor,
            prefix,
            started: false,
            done: false,
        })
    }

    /// Position at the first matching entry. Idempotent: calling it again
    /// restarts the scan from the beginning.
    pub fn first(&mut self) -> Result<()> {
        self.started = true;
        self.done = false;
        match &self.prefix {
            None => {
                self.done = self.cursor.first()?;
            }
            Some(prefix) => {
                let record = UnpackedRecord::new(prefix.clone());
                let seek_result = self.cursor.index_moveto(&record)?;
                if seek_result == 1 && !self.cursor.eof() {
                    self.cursor.next(0)?;
                }
                self.done = self.cursor.eof();
            }
        }
        self.settle_prefix_bound();
        Ok(())
    }

    /// Advance to the next matching entry.
    pub fn next(&mut self) -> Result<()> {
        if !self.started {
            return self.first();
        }
        if self.done {
            return Ok(());
        }
        self.cursor.next(0)?;
        self.done = self.cursor.eof();
        self.settle_prefix_bound();
        Ok(())
    }

    /// If a prefix filter is set and the cursor has scanned past the last
    /// key sharing it, mark the iterator done.
    fn settle_prefix_bound(&mut self) {
        if self.done {
            return;
        }
        let Some(prefix) = &self.prefix else {
            return;
        };
        let size = self.cursor.payload_size();
        let payload = match self.cursor.payload(0, size) {
            Ok(p) => p,
            Err(_) => {
                self.done = true;
                return;
            }
        };
        let Ok((key, _value)) = decode_cell(&payload) else {
            self.done = true;
            return;
        };
        if !key.starts_with(prefix.as_slice()) {
            self.done = true;
        }
    }

    pub fn eof(&self) -> bool {
        self.done
    }

    pub fn key(&self) -> Result<Vec<u8>> {
        let size = self.cursor.payload_size();
        let payload = self.cursor.payload(0, size)?;
        let (key, _value) = decode_cell(&payload)?;
        Ok(key.to_vec())
    }

    pub fn value(&self) -> Result<Vec<u8>> {
        let size = self.cursor.payload_size();
        let payload = self.cursor.payload(0, size)?;
        let (_key, value) = decode_cell(&payload)?;
        Ok(value.to_vec())
    }

    /// Release the underlying cursor. After this, the iterator reports EOF.
    pub fn close(&mut self) {
        self.done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::catalog::open_or_create_default_cf;
    use crate::kv::ops::put;
    use crate::os::unix::UnixVfs;
    use crate::storage::btree::BtreeOpenFlags;
    use crate::types::OpenFlags;

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

    fn default_cf(btree: &Arc<Btree>) -> Arc<CfHandle> {
        btree.begin_trans(true).unwrap();
        let (root, _meta) = open_or_create_default_cf(btree).unwrap();
        btree.commit().unwrap();
        CfHandle::new("default".to_string(), root, None)
    }

    #[test]
    fn iterates_all_keys_in_order() {
        let btree = memory_btree();
        let cf = default_cf(&btree);
        btree.begin_trans(true).unwrap();
        for k in ["a", "b", "c"] {
            put(&btree, &cf, k.as_bytes(), b"v").unwrap();
        }
        btree.commit().unwrap();

        btree.begin_trans(false).unwrap();
        let mut it = CfIterator::open(&btree, &cf, None).unwrap();
        it.first().unwrap();
        let mut seen = Vec::new();
        while !it.eof() {
            seen.push(String::from_utf8(it.key().unwrap()).unwrap());
            it.next().unwrap();
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
        btree.rollback(0, false).unwrap();
    }

    #[test]
    fn prefix_filter_restricts_scan() {
        let btree = memory_btree();
        let cf = default_cf(&btree);
        btree.begin_trans(true).unwrap();
        for k in ["apple", "apricot", "banana"] {
            put(&btree, &cf, k.as_bytes(), b"v").unwrap();
        }
        btree.commit().unwrap();

        btree.begin_trans(false).unwrap();
        let mut it = CfIterator::open(&btree, &cf, Some(b"ap".to_vec())).unwrap();
        it.first().unwrap();
        let mut seen = Vec::new();
        while !it.eof() {
            seen.push(String::from_utf8(it.key().unwrap()).unwrap());
            it.next().unwrap();
        }
        assert_eq!(seen, vec!["apple", "apricot"]);
        btree.rollback(0, false).unwrap();
    }

    #[test]
    fn empty_table_is_immediately_eof() {
        let btree = memory_btree();
        let cf = default_cf(&btree);
        btree.begin_trans(false).unwrap();
        let mut it = CfIterator::open(&btree, &cf, None).unwrap();
        it.first().unwrap();
        assert!(it.eof());
        btree.rollback(0, false).unwrap();
    }

    #[test]
    fn prefix_with_no_matches_is_immediately_eof() {
        let btree = memory_btree();
        let cf = default_cf(&btree);
        btree.begin_trans(true).unwrap();
        put(&btree, &cf, b"zebra", b"v").unwrap();
        btree.commit().unwrap();

        btree.begin_trans(false).unwrap();
        let mut it = CfIterator::open(&btree, &cf, Some(b"ap".to_vec())).unwrap();
        it.first().unwrap();
        assert!(it.eof());
        btree.rollback(0, false).unwrap();
    }
}
