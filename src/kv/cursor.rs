//! Cursor allocation and seek helpers shared by every `kv` module.
//!
//! `Btree::cursor` already allocates a fully-formed [`BtCursor`] value (this
//! is Rust, not the C-style "allocate opaque storage of reported size" the
//! page-store contract describes for other VFS-backed callers), so
//! `alloc_cursor` here is a thin, typed wrapper that always threads through
//! the shared one-field [`KeyInfo`] blob comparator.

use std::sync::Arc;

use crate::error::Result;
use crate::storage::btree::{Btree, BtCursor, BtreeCursorFlags, KeyInfo, UnpackedRecord};
use crate::types::Pgno;

/// Open a cursor on `root_page`, parameterized by the shared blob-key
/// comparator. `writable` selects [`BtreeCursorFlags::WRCSR`].
pub fn alloc_cursor(
    btree: &Arc<Btree>,
    root_page: Pgno,
    writable: bool,
    key_info: Arc<KeyInfo>,
) -> Result<BtCursor> {
    let flags = if writable {
        BtreeCursorFlags::WRCSR
    } else {
        BtreeCursorFlags::empty()
    };
    btree.cursor(root_page, flags, Some(key_info))
}

/// Position `cursor` at the cell whose key equals `key`.
///
/// Returns `found=true` (and leaves the cursor on the matched cell) iff the
/// comparator reports an exact match; otherwise the cursor is left at the
/// nearest neighbor, the same convention `index_moveto` uses internally.
pub fn seek_blob(cursor: &mut BtCursor, key: &[u8]) -> Result<bool> {
    let record = UnpackedRecord::new(key.to_vec());
    let seek_result = cursor.index_moveto(&record)?;
    Ok(seek_result == 0)
}

/// Position `cursor` at the integer-keyed row `rowid` (used for the
/// metadata table, which is keyed by `hash(name)` rather than a blob).
pub fn seek_rowid(cursor: &mut BtCursor, rowid: i64) -> Result<bool> {
    let seek_result = cursor.table_moveto(rowid, false)?;
    Ok(seek_result == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::unix::UnixVfs;
    use crate::storage::btree::{BtreeInsertFlags, BtreeOpenFlags, BtreePayload};
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

    #[test]
    fn seek_blob_finds_inserted_key() {
        let btree = memory_btree();
        btree.begin_trans(true).unwrap();
        let root = btree.create_table(crate::storage::btree::BTREE_BLOBKEY).unwrap();
        let key_info = Arc::new(KeyInfo::new(1));
        let mut cursor = alloc_cursor(&btree, root, true, key_info.clone()).unwrap();
        let cell = crate::kv::codec::encode_cell(b"hello", b"world");
        let payload = BtreePayload {
            key: Some(cell),
            n_key: 0,
            data: None,
            mem: Vec::new(),
            n_data: 0,
            n_zero: 0,
        };
        btree
            .insert(&mut cursor, &payload, BtreeInsertFlags::empty(), 0)
            .unwrap();

        let mut cursor = alloc_cursor(&btree, root, false, key_info).unwrap();
        assert!(seek_blob(&mut cursor, b"hello").unwrap());
        assert!(!seek_blob(&mut cursor, b"nope").unwrap());
        btree.commit().unwrap();
    }
}
