//! Column-family handles: the open, reference-counted view of one data
//! table plus its optional TTL index pair.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::os::mutex::{mutex_alloc, RecursiveMutex, MUTEX_RECURSIVE};
use crate::storage::btree::{BtCursor, KeyInfo};
use crate::types::Pgno;

/// The two internal tables backing a column family's TTL bookkeeping:
/// `key -> expiry` and `expiry -> key`, so both lazy lookup and bulk sweep
/// run without a full scan.
pub struct TtlIndex {
    pub key_to_expiry_root: Pgno,
    pub expiry_to_key_root: Pgno,
}

/// One open column family. Cheaply `Clone`-able (`Arc`-backed); every
/// clone shares the same cached cursors and lock.
pub struct CfHandle {
    pub name: String,
    pub root_page: Pgno,
    pub(crate) key_info: Arc<KeyInfo>,
    pub(crate) mutex: Option<Arc<RecursiveMutex>>,
    refcount: AtomicU32,
    cached_cursor: Mutex<Option<BtCursor>>,
    cached_ttl_cursor: Mutex<Option<BtCursor>>,
    ttl: Option<TtlIndex>,
}

impl CfHandle {
    pub(crate) fn new(name: String, root_page: Pgno, ttl: Option<TtlIndex>) -> Arc<Self> {
        Arc::new(Self {
            name,
            root_page,
            key_info: Arc::new(KeyInfo::new(1)),
            mutex: mutex_alloc(MUTEX_RECURSIVE),
            refcount: AtomicU32::new(1),
            cached_cursor: Mutex::new(None),
            cached_ttl_cursor: Mutex::new(None),
            ttl,
        })
    }

    pub fn has_ttl(&self) -> bool {
        self.ttl.is_some()
    }

    pub(crate) fn ttl(&self) -> Option<&TtlIndex> {
        self.ttl.as_ref()
    }

    pub(crate) fn attach_ttl(&mut self, ttl: TtlIndex) {
        self.ttl = Some(ttl);
    }

    pub(crate) fn retain(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the refcount, returning `true` when it reaches zero (the
    /// caller should then drop this handle from the store's open-CF table).
    pub(crate) fn release(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub(crate) fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Take the cached data-CF read cursor, if one is parked, leaving `None`
    /// behind. Callers are expected to put it back with
    /// [`CfHandle::park_cursor`] once they're done, or simply drop it to
    /// force reallocation.
    pub(crate) fn take_cursor(&self) -> Option<BtCursor> {
        self.cached_cursor.lock().unwrap().take()
    }

    pub(crate) fn park_cursor(&self, cursor: BtCursor) {
        *self.cached_cursor.lock().unwrap() = Some(cursor);
    }

    /// Take the cached Key→Expiry read cursor used by `kv::ttl::lookup_expiry`.
    pub(crate) fn take_ttl_cursor(&self) -> Option<BtCursor> {
        self.cached_ttl_cursor.lock().unwrap().take()
    }

    pub(crate) fn park_ttl_cursor(&self, cursor: BtCursor) {
        *self.cached_ttl_cursor.lock().unwrap() = Some(cursor);
    }

    /// Force-close both cached read cursors. Called before any write that
    /// may invalidate cursor position on structural change (put, delete,
    /// TTL cleanup, bulk purge).
    pub(crate) fn invalidate_cursor(&self) {
        self.cached_cursor.lock().unwrap().take();
        self.cached_ttl_cursor.lock().unwrap().take();
    }

    pub(crate) fn lock(&self) -> super::MutexGuard<'_> {
        super::MutexGuard::acquire(self.mutex.as_ref())
    }
}

pub(crate) fn ttl_key_index_name(cf_name: &str) -> String {
    format!("{}snkv_ttl_k__{}", super::RESERVED_PREFIX, cf_name)
}

pub(crate) fn ttl_expiry_index_name(cf_name: &str) -> String {
    format!("{}snkv_ttl_e__{}", super::RESERVED_PREFIX, cf_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_tracks_retain_and_release() {
        let handle = CfHandle::new("cfA".to_string(), 2, None);
        assert_eq!(handle.refcount(), 1);
        handle.retain();
        assert_eq!(handle.refcount(), 2);
        assert!(!handle.release());
        assert!(handle.release());
    }

    #[test]
    fn cursor_parking_round_trips_none() {
        let handle = CfHandle::new("cfA".to_string(), 2, None);
        assert!(handle.take_cursor().is_none());
    }

    #[test]
    fn reserved_names_are_distinct_per_cf() {
        assert_ne!(ttl_key_index_name("a"), ttl_key_index_name("b"));
        assert!(ttl_key_index_name("a").starts_with(super::super::RESERVED_PREFIX));
    }
}
