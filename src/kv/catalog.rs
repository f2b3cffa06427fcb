//! Column-family catalog: name → root-page lookups backed by an
//! integer-keyed metadata B-tree, open-addressed on FNV-1a(name).

use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::btree::{Btree, BtreeCursorFlags, BtreeInsertFlags, BtreePayload, BTREE_BLOBKEY, BTREE_INTKEY};
use crate::types::{Pgno, RowId};

use super::cursor::seek_rowid;
use super::{MAX_CF_NAME_LEN, MAX_META_PROBES, RESERVED_PREFIX};

/// Meta slot holding the default CF's root page. Slots 0-8 are claimed by
/// the page store itself (free-page count, schema/user version, auto-vacuum
/// bookkeeping, application id); `kv` claims the first three slots above
/// `BTREE_APPLICATION_ID` for its own catalog bootstrap.
pub const META_DEFAULT_CF_ROOT: usize = 9;
/// Meta slot holding the number of open column families.
pub const META_CF_COUNT: usize = 10;
/// Meta slot holding the metadata table's own root page.
pub const META_METADATA_ROOT: usize = 11;

/// One resolved catalog entry.
pub struct MetaEntry {
    pub rowid: RowId,
    pub name: String,
    pub root_page: Pgno,
}

/// FNV-1a 64-bit hash of a CF name, masked positive with zero escaped to 1
/// (rowid 0 is reserved by the page store's own conventions).
pub fn hash_name(name: &str) -> RowId {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &byte in name.as_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let masked = (hash & 0x7fff_ffff_ffff_ffff) as RowId;
    if masked == 0 {
        1
    } else {
        masked
    }
}

fn encode_meta_payload(name: &str, root_page: Pgno) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + name.len() + 4);
    payload.extend_from_slice(&(name.len() as u32).to_be_bytes());
    payload.extend_from_slice(name.as_bytes());
    payload.extend_from_slice(&root_page.to_be_bytes());
    payload
}

fn decode_meta_payload(payload: &[u8]) -> Result<(String, Pgno)> {
    if payload.len() < 4 {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    let name_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if 4 + name_len + 4 > payload.len() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    let name = std::str::from_utf8(&payload[4..4 + name_len])
        .map_err(|_| Error::new(ErrorCode::Corrupt))?
        .to_string();
    let root_bytes = &payload[4 + name_len..4 + name_len + 4];
    let root_page = u32::from_be_bytes([root_bytes[0], root_bytes[1], root_bytes[2], root_bytes[3]]);
    Ok((name, root_page))
}

/// Reject names the public catalog APIs must never accept.
pub fn validate_cf_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_CF_NAME_LEN {
        return Err(Error::with_message(
            ErrorCode::Error,
            format!("column family name must be 1..={MAX_CF_NAME_LEN} bytes"),
        ));
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err(Error::with_message(
            ErrorCode::Error,
            format!("column family names starting with '{RESERVED_PREFIX}' are reserved"),
        ));
    }
    Ok(())
}

/// Find the existing metadata entry for `name`, probing linearly from
/// `hash(name)`. `None` means the name has never been inserted (the probe
/// hit a genuinely empty rowid slot before finding a name match).
pub fn meta_seek(btree: &Arc<Btree>, meta_root: Pgno, name: &str) -> Result<Option<MetaEntry>> {
    let start = hash_name(name);
    let mut cursor = btree.cursor(meta_root, BtreeCursorFlags::empty(), None)?;
    for probe in 0..MAX_META_PROBES {
        let rowid = start.wrapping_add(probe as i64);
        if !seek_rowid(&mut cursor, rowid)? {
            return Ok(None);
        }
        let size = cursor.payload_size();
        let payload = cursor.payload(0, size)?;
        let (stored_name, root_page) = decode_meta_payload(&payload)?;
        if stored_name == name {
            return Ok(Some(MetaEntry {
                rowid,
                name: stored_name,
                root_page,
            }));
        }
    }
    Err(Error::new(ErrorCode::Full))
}

/// Find the first unoccupied rowid in the probe sequence starting at
/// `hash(name)`, for inserting a brand new entry.
fn meta_find_slot(btree: &Arc<Btree>, meta_root: Pgno, name: &str) -> Result<RowId> {
    let start = hash_name(name);
    let mut cursor = btree.cursor(meta_root, BtreeCursorFlags::empty(), None)?;
    for probe in 0..MAX_META_PROBES {
        let rowid = start.wrapping_add(probe as i64);
        if !seek_rowid(&mut cursor, rowid)? {
            return Ok(rowid);
        }
    }
    Err(Error::new(ErrorCode::Full))
}

fn insert_meta_entry(btree: &Arc<Btree>, meta_root: Pgno, rowid: RowId, name: &str, root_page: Pgno) -> Result<()> {
    let mut cursor = btree.cursor(meta_root, BtreeCursorFlags::WRCSR, None)?;
    let data = encode_meta_payload(name, root_page);
    let payload = BtreePayload {
        key: None,
        n_key: rowid,
        n_data: data.len() as i32,
        data: Some(data),
        mem: Vec::new(),
        n_zero: 0,
    };
    btree.insert(&mut cursor, &payload, BtreeInsertFlags::empty(), 0)
}

fn delete_meta_entry(btree: &Arc<Btree>, meta_root: Pgno, rowid: RowId) -> Result<()> {
    let mut cursor = btree.cursor(meta_root, BtreeCursorFlags::WRCSR, None)?;
    if !seek_rowid(&mut cursor, rowid)? {
        return Err(Error::new(ErrorCode::NotFound));
    }
    btree.delete(&mut cursor, BtreeInsertFlags::empty())
}

/// Bootstrap a fresh database: a blob-keyed default CF table and an
/// integer-keyed metadata table, with meta slots 1/2/3 (here 9/10/11)
/// recording the default root, CF count, and metadata root. On an existing
/// database, simply read those slots back. Returns `(default_root,
/// metadata_root)`.
pub fn open_or_create_default_cf(btree: &Arc<Btree>) -> Result<(Pgno, Pgno)> {
    let existing_default = btree.get_meta(META_DEFAULT_CF_ROOT)?;
    if existing_default != 0 {
        let meta_root = btree.get_meta(META_METADATA_ROOT)?;
        return Ok((existing_default, meta_root));
    }

    let meta_root = btree.create_table(BTREE_INTKEY)?;
    let default_root = btree.create_table(BTREE_BLOBKEY)?;
    let rowid = meta_find_slot(btree, meta_root, super::DEFAULT_CF)?;
    insert_meta_entry(btree, meta_root, rowid, super::DEFAULT_CF, default_root)?;
    btree.update_meta(META_DEFAULT_CF_ROOT, default_root)?;
    btree.update_meta(META_METADATA_ROOT, meta_root)?;
    btree.update_meta(META_CF_COUNT, 1)?;
    Ok((default_root, meta_root))
}

/// Create a brand new column family's data table and catalog entry.
/// Must run inside a write transaction. Fails `Error` if the name is
/// already taken.
pub fn create_cf(btree: &Arc<Btree>, meta_root: Pgno, name: &str) -> Result<Pgno> {
    if meta_seek(btree, meta_root, name)?.is_some() {
        return Err(Error::with_message(
            ErrorCode::Error,
            format!("column family '{name}' already exists"),
        ));
    }
    let root_page = btree.create_table(BTREE_BLOBKEY)?;
    let rowid = meta_find_slot(btree, meta_root, name)?;
    insert_meta_entry(btree, meta_root, rowid, name, root_page)?;
    let count = btree.get_meta(META_CF_COUNT)?;
    btree.update_meta(META_CF_COUNT, count + 1)?;
    Ok(root_page)
}

/// Look up the root page of an existing column family (including reserved,
/// internal TTL CFs - the reserved-name check is a public-API concern
/// enforced by `kv::store`/`kv::ttl`, not by the catalog itself).
pub fn open_cf(btree: &Arc<Btree>, meta_root: Pgno, name: &str) -> Result<Pgno> {
    meta_seek(btree, meta_root, name)?
        .map(|entry| entry.root_page)
        .ok_or_else(|| Error::new(ErrorCode::NotFound))
}

/// Drop a column family: remove its catalog entry, drop its table, and
/// decrement the CF count. The default CF can never be dropped.
pub fn drop_cf(btree: &Arc<Btree>, meta_root: Pgno, name: &str) -> Result<()> {
    if name == super::DEFAULT_CF {
        return Err(Error::with_message(
            ErrorCode::Error,
            "the default column family cannot be dropped",
        ));
    }
    let entry = meta_seek(btree, meta_root, name)?.ok_or_else(|| Error::new(ErrorCode::NotFound))?;
    delete_meta_entry(btree, meta_root, entry.rowid)?;
    btree.drop_table(entry.root_page)?;
    let count = btree.get_meta(META_CF_COUNT)?;
    btree.update_meta(META_CF_COUNT, count.saturating_sub(1))?;
    Ok(())
}

/// List every user-visible column family name (reserved `__`-prefixed
/// names, used internally by TTL bookkeeping, are never returned).
pub fn list_cf(btree: &Arc<Btree>, meta_root: Pgno) -> Result<Vec<String>> {
    let mut cursor = btree.cursor(meta_root, BtreeCursorFlags::empty(), None)?;
    let mut names = Vec::new();
    if cursor.first()? {
        return Ok(names);
    }
    loop {
        if cursor.eof() {
            break;
        }
        let size = cursor.payload_size();
        let payload = cursor.payload(0, size)?;
        let (name, _root) = decode_meta_payload(&payload)?;
        if !name.starts_with(RESERVED_PREFIX) {
            names.push(name);
        }
        cursor.next(0)?;
    }
    Ok(names)
}

/// Every root page recorded in the metadata table, including reserved
/// (`__`-prefixed) TTL index entries. Used by `integrity_check`, which must
/// validate every table in the file, not just the CFs currently open in
/// memory.
pub fn all_roots(btree: &Arc<Btree>, meta_root: Pgno) -> Result<Vec<Pgno>> {
    let mut cursor = btree.cursor(meta_root, BtreeCursorFlags::empty(), None)?;
    let mut roots = Vec::new();
    if cursor.first()? {
        return Ok(roots);
    }
    loop {
        if cursor.eof() {
            break;
        }
        let size = cursor.payload_size();
        let payload = cursor.payload(0, size)?;
        let (_name, root_page) = decode_meta_payload(&payload)?;
        roots.push(root_page);
        cursor.next(0)?;
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn hash_name_never_yields_zero() {
        for name in ["", "default", "a", "__snkv_ttl_k__x"] {
            assert_ne!(hash_name(name), 0);
        }
    }

    #[test]
    fn bootstrap_then_reopen_reads_back_same_roots() {
        let btree = memory_btree();
        btree.begin_trans(true).unwrap();
        let (default_root, meta_root) = open_or_create_default_cf(&btree).unwrap();
        btree.commit().unwrap();

        btree.begin_trans(false).unwrap();
        let (default_root2, meta_root2) = open_or_create_default_cf(&btree).unwrap();
        assert_eq!(default_root, default_root2);
        assert_eq!(meta_root, meta_root2);
        btree.rollback(0, false).unwrap();
    }

    #[test]
    fn create_and_open_and_list_and_drop() {
        let btree = memory_btree();
        btree.begin_trans(true).unwrap();
        let (_default_root, meta_root) = open_or_create_default_cf(&btree).unwrap();
        create_cf(&btree, meta_root, "cfA").unwrap();
        btree.commit().unwrap();

        btree.begin_trans(false).unwrap();
        assert!(open_cf(&btree, meta_root, "cfA").is_ok());
        let mut names = list_cf(&btree, meta_root).unwrap();
        names.sort();
        assert_eq!(names, vec!["cfA".to_string(), "default".to_string()]);
        btree.rollback(0, false).unwrap();

        btree.begin_trans(true).unwrap();
        drop_cf(&btree, meta_root, "cfA").unwrap();
        btree.commit().unwrap();

        btree.begin_trans(false).unwrap();
        assert!(matches!(
            open_cf(&btree, meta_root, "cfA"),
            Err(e) if e.code() == ErrorCode::NotFound
        ));
        btree.rollback(0, false).unwrap();
    }

    #[test]
    fn all_roots_includes_reserved_entries() {
        let btree = memory_btree();
        btree.begin_trans(true).unwrap();
        let (default_root, meta_root) = open_or_create_default_cf(&btree).unwrap();
        let cf_a_root = create_cf(&btree, meta_root, "cfA").unwrap();
        let hidden_root = create_cf(&btree, meta_root, "__snkv_ttl_k__cfA").unwrap();
        btree.commit().unwrap();

        btree.begin_trans(false).unwrap();
        let mut roots = all_roots(&btree, meta_root).unwrap();
        roots.sort();
        let mut expected = vec![default_root, cf_a_root, hidden_root];
        expected.sort();
        assert_eq!(roots, expected);
        btree.rollback(0, false).unwrap();
    }

    #[test]
    fn duplicate_create_fails() {
        let btree = memory_btree();
        btree.begin_trans(true).unwrap();
        let (_default_root, meta_root) = open_or_create_default_cf(&btree).unwrap();
        create_cf(&btree, meta_root, "cfA").unwrap();
        assert!(create_cf(&btree, meta_root, "cfA").is_err());
        btree.commit().unwrap();
    }

    #[test]
    fn default_cf_cannot_be_dropped() {
        let btree = memory_btree();
        btree.begin_trans(true).unwrap();
        let (_default_root, meta_root) = open_or_create_default_cf(&btree).unwrap();
        assert!(drop_cf(&btree, meta_root, super::super::DEFAULT_CF).is_err());
        btree.commit().unwrap();
    }

    #[test]
    fn reserved_name_rejected() {
        assert!(validate_cf_name("__hidden").is_err());
        assert!(validate_cf_name("").is_err());
        assert!(validate_cf_name(&"x".repeat(MAX_CF_NAME_LEN + 1)).is_err());
        assert!(validate_cf_name("cfA").is_ok());
    }
}
