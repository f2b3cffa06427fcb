//! The public entry point: [`Store::open`], column-family management, and
//! the point/iteration operations layered on top of [`super::txn::TxnManager`].

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::global_config;
use crate::error::{Error, ErrorCode, Result};
use crate::storage::btree::{Btree, BtreeOpenFlags};
use crate::storage::pager::{JournalMode as PagerJournalMode, PagerFlags};
use crate::types::{OpenFlags, Pgno, Vfs};
use crate::util::general::{log_message, LogLevel};

use super::admin::{self, CheckpointMode, StoreStats, StoreStatsSnapshot};
use super::catalog;
use super::cf::CfHandle;
use super::iter::CfIterator;
use super::ops;
use super::ttl;
use super::txn::TxnManager;
use super::{MAX_META_PROBES, NO_TTL};

/// Simplified journal mode a caller can request: either classic rollback
/// journaling or write-ahead logging. Maps onto [`PagerJournalMode`]'s wider
/// set of internal variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    Delete,
    Wal,
}

impl From<JournalMode> for PagerJournalMode {
    fn from(mode: JournalMode) -> Self {
        match mode {
            JournalMode::Delete => PagerJournalMode::Delete,
            JournalMode::Wal => PagerJournalMode::Wal,
        }
    }
}

/// How hard a commit should push bytes to disk before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncLevel {
    Off,
    Normal,
    Full,
}

impl From<SyncLevel> for PagerFlags {
    fn from(level: SyncLevel) -> Self {
        match level {
            SyncLevel::Off => PagerFlags::SYNCHRONOUS_OFF,
            SyncLevel::Normal => PagerFlags::SYNCHRONOUS_NORMAL,
            SyncLevel::Full => PagerFlags::SYNCHRONOUS_FULL,
        }
    }
}

/// Tuning knobs for [`Store::open_v2`]. [`Default`] falls back to the
/// process-wide [`crate::config::GlobalConfig`] for page size and cache
/// size when left unset.
pub struct StoreOptions {
    pub page_size: Option<u32>,
    pub cache_size: Option<i32>,
    pub journal_mode: JournalMode,
    pub sync_level: SyncLevel,
    pub busy_timeout: Duration,
    /// Number of committed write transactions between automatic passive
    /// checkpoints; `0` disables auto-checkpointing.
    pub wal_size_limit: u32,
    pub create_if_missing: bool,
    /// Open read-only; fails with `Error` if the database doesn't already
    /// exist.
    pub read_only: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: None,
            cache_size: None,
            journal_mode: JournalMode::Wal,
            sync_level: SyncLevel::Normal,
            busy_timeout: Duration::from_secs(5),
            wal_size_limit: 1000,
            create_if_missing: true,
            read_only: false,
        }
    }
}

/// An open key-value store: one page-store file, one default column
/// family, and zero or more user-created ones.
pub struct Store {
    btree: Arc<Btree>,
    txn: Mutex<TxnManager>,
    meta_root: Pgno,
    cf_table: Mutex<HashMap<String, Arc<CfHandle>>>,
    stats: StoreStats,
    busy_timeout: Duration,
    wal_size_limit: u32,
}

impl Store {
    /// Open (creating if necessary) the store at `path` with default
    /// options. `path` may be `:memory:` for a throwaway in-memory store.
    pub fn open<V: Vfs + Clone + 'static>(vfs: &V, path: &str) -> Result<Store>
    where
        V::File: 'static,
    {
        Self::open_v2(vfs, path, StoreOptions::default())
    }

    /// Open with explicit tuning. See [`StoreOptions`].
    pub fn open_v2<V: Vfs + Clone + 'static>(vfs: &V, path: &str, options: StoreOptions) -> Result<Store>
    where
        V::File: 'static,
    {
        let is_memory = path == ":memory:";
        let open_flags = if options.read_only {
            OpenFlags::READONLY
        } else {
            let mut flags = OpenFlags::READWRITE;
            if options.create_if_missing {
                flags |= OpenFlags::CREATE;
            }
            flags
        };
        let mut bt_flags = BtreeOpenFlags::empty();
        if is_memory {
            bt_flags |= BtreeOpenFlags::MEMORY;
        }

        let btree = Btree::open(vfs, path, None, bt_flags, open_flags)?;
        let page_size = options
            .page_size
            .unwrap_or_else(|| global_config().page_size.load(Ordering::Relaxed) as u32);
        btree.set_page_size(page_size, -1, true)?;
        let cache_size = options
            .cache_size
            .unwrap_or_else(|| global_config().page_cache_size.load(Ordering::Relaxed) as i32);
        btree.set_cache_size(cache_size);
        btree.set_pager_flags(options.sync_level.into());
        if !is_memory && !options.read_only {
            btree.set_journal_mode(options.journal_mode.into())?;
        }

        let mut txn = TxnManager::new(btree.clone());
        txn.begin(!options.read_only)?;
        let (default_root, meta_root) = catalog::open_or_create_default_cf(&btree)?;
        txn.commit()?;

        let mut cf_table = HashMap::new();
        cf_table.insert(
            super::DEFAULT_CF.to_string(),
            CfHandle::new(super::DEFAULT_CF.to_string(), default_root, None),
        );

        Ok(Store {
            btree,
            txn: Mutex::new(txn),
            meta_root,
            cf_table: Mutex::new(cf_table),
            stats: StoreStats::new(),
            busy_timeout: options.busy_timeout,
            wal_size_limit: options.wal_size_limit,
        })
    }

    /// Flush the persistent read transaction and release in-memory state.
    /// Any open [`CfIterator`]s become invalid.
    pub fn close(&self) -> Result<()> {
        let mut txn = self.txn.lock().unwrap();
        txn.rollback(false)
    }

    fn begin_with_busy_retry(&self, txn: &mut TxnManager, write: bool) -> Result<()> {
        let start = Instant::now();
        loop {
            match txn.begin(write) {
                Ok(()) => return Ok(()),
                Err(err) if err.code() == ErrorCode::Busy && start.elapsed() < self.busy_timeout => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn with_write<T>(&self, f: impl FnOnce(&Arc<Btree>) -> Result<T>) -> Result<T> {
        let mut txn = self.txn.lock().unwrap();
        self.begin_with_busy_retry(&mut txn, true)?;
        let result = f(&self.btree);
        match result {
            Ok(value) => {
                let was_write = txn.commit()?;
                if was_write {
                    self.maybe_auto_checkpoint(&mut txn);
                }
                Ok(value)
            }
            Err(err) => {
                let _ = txn.rollback(true);
                Err(err)
            }
        }
    }

    fn with_read<T>(&self, f: impl FnOnce(&Arc<Btree>) -> Result<T>) -> Result<T> {
        let mut txn = self.txn.lock().unwrap();
        self.begin_with_busy_retry(&mut txn, false)?;
        f(&self.btree)
    }

    /// Release the persistent read (if any), run `f` with no transaction
    /// held at the pager level, then restore the persistent read.
    fn run_with_notx<T>(&self, txn: &mut TxnManager, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let had_read = txn.release_for_notx()?;
        let result = f();
        if had_read {
            txn.reopen_persistent_read()?;
        }
        result
    }

    fn maybe_auto_checkpoint(&self, txn: &mut TxnManager) {
        if self.wal_size_limit == 0 {
            return;
        }
        let commits = txn.commits_since_checkpoint();
        if commits < self.wal_size_limit {
            return;
        }
        txn.take_commit_count();
        let checkpointed = self.run_with_notx(txn, || admin::checkpoint(&self.btree, CheckpointMode::Passive));
        if let Ok((_wal_frames, checkpointed)) = checkpointed {
            log_message(
                LogLevel::Notice,
                &format!("auto-checkpoint copied {checkpointed} frame(s) after {commits} write commit(s)"),
            );
        }
    }

    fn lookup_cf(&self, name: &str) -> Option<Arc<CfHandle>> {
        self.cf_table.lock().unwrap().get(name).cloned()
    }

    fn require_cf(&self, name: &str) -> Result<Arc<CfHandle>> {
        self.lookup_cf(name).ok_or_else(|| Error::new(ErrorCode::NotFound))
    }

    /// Create a new column family. `with_ttl` decides whether keys in it
    /// can carry a TTL via [`Store::put_ttl`].
    pub fn create_cf(&self, name: &str, with_ttl: bool) -> Result<()> {
        catalog::validate_cf_name(name)?;
        if self.lookup_cf(name).is_some() {
            return Err(Error::with_message(
                ErrorCode::Error,
                format!("column family '{name}' already exists"),
            ));
        }
        let handle = self.with_write(|btree| {
            let root = catalog::create_cf(btree, self.meta_root, name)?;
            let ttl_index = if with_ttl {
                Some(ttl::ensure_ttl_cfs(btree, self.meta_root, name)?)
            } else {
                None
            };
            Ok(CfHandle::new(name.to_string(), root, ttl_index))
        })?;
        self.cf_table.lock().unwrap().insert(name.to_string(), handle);
        Ok(())
    }

    /// Open an already-existing column family, caching the handle for
    /// subsequent calls.
    pub fn open_cf(&self, name: &str) -> Result<()> {
        if self.lookup_cf(name).is_some() {
            return Ok(());
        }
        let handle = self.with_read(|btree| {
            let root = catalog::open_cf(btree, self.meta_root, name)?;
            let ttl_index = match (
                catalog::open_cf(btree, self.meta_root, &super::cf::ttl_key_index_name(name)),
                catalog::open_cf(btree, self.meta_root, &super::cf::ttl_expiry_index_name(name)),
            ) {
                (Ok(key_to_expiry_root), Ok(expiry_to_key_root)) => Some(super::cf::TtlIndex {
                    key_to_expiry_root,
                    expiry_to_key_root,
                }),
                _ => None,
            };
            Ok(CfHandle::new(name.to_string(), root, ttl_index))
        })?;
        self.cf_table.lock().unwrap().insert(name.to_string(), handle);
        Ok(())
    }

    /// Drop a column family and its data. The default column family cannot
    /// be dropped.
    pub fn drop_cf(&self, name: &str) -> Result<()> {
        self.with_write(|btree| {
            catalog::drop_cf(btree, self.meta_root, name)?;
            let key_name = super::cf::ttl_key_index_name(name);
            let expiry_name = super::cf::ttl_expiry_index_name(name);
            let _ = catalog::drop_cf(btree, self.meta_root, &key_name);
            let _ = catalog::drop_cf(btree, self.meta_root, &expiry_name);
            Ok(())
        })?;
        self.cf_table.lock().unwrap().remove(name);
        Ok(())
    }

    /// List every user-visible column family name.
    pub fn list_cf(&self) -> Result<Vec<String>> {
        self.with_read(|btree| catalog::list_cf(btree, self.meta_root))
    }

    pub fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let result = self
            .require_cf(cf_name)
            .and_then(|cf| self.with_write(|btree| ops::put(btree, &cf, key, value)));
        self.record_result(&result, StoreStats::record_put);
        result
    }

    pub fn put_ttl(&self, cf_name: &str, key: &[u8], value: &[u8], expires_at_ms: i64) -> Result<()> {
        let result = self
            .require_cf(cf_name)
            .and_then(|cf| self.with_write(|btree| ops::put_ttl(btree, &cf, key, value, expires_at_ms)));
        self.record_result(&result, StoreStats::record_put);
        result
    }

    /// Fetch `key`'s value. If its TTL has elapsed, this lazily purges the
    /// stale data cell and both TTL index entries before reporting `None`,
    /// the same cleanup a bulk [`Store::purge_expired`] would perform.
    pub fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let result = self.require_cf(cf_name).and_then(|cf| {
            let expired = cf.has_ttl() && self.with_read(|btree| ttl::is_expired(btree, &cf, key))?;
            if expired {
                self.with_write(|btree| {
                    ops::delete_cell_only(btree, &cf, key)?;
                    ttl::clear_ttl(btree, &cf, key)?;
                    Ok(None)
                })
            } else {
                self.with_read(|btree| ops::get(btree, &cf, key))
            }
        });
        self.record_result(&result, StoreStats::record_get);
        result
    }

    pub fn exists(&self, cf_name: &str, key: &[u8]) -> Result<bool> {
        let cf = self.require_cf(cf_name)?;
        self.with_read(|btree| ops::exists(btree, &cf, key))
    }

    pub fn delete(&self, cf_name: &str, key: &[u8]) -> Result<bool> {
        let result = self
            .require_cf(cf_name)
            .and_then(|cf| self.with_write(|btree| ops::delete(btree, &cf, key)));
        self.record_result(&result, StoreStats::record_delete);
        result
    }

    /// Milliseconds until `key` expires, or [`NO_TTL`] if it carries none.
    pub fn ttl_remaining(&self, cf_name: &str, key: &[u8]) -> Result<i64> {
        let cf = self.require_cf(cf_name)?;
        if !cf.has_ttl() {
            return Ok(NO_TTL);
        }
        self.with_read(|btree| ttl::ttl_remaining(btree, &cf, key))
    }

    /// Sweep up to `limit` elapsed entries from `cf_name`'s TTL index.
    pub fn purge_expired(&self, cf_name: &str, limit: usize) -> Result<u64> {
        let cf = self.require_cf(cf_name)?;
        if !cf.has_ttl() {
            return Ok(0);
        }
        let now = ttl::now_ms();
        let purged = self.with_write(|btree| ttl::purge_expired(btree, &cf, now, limit))?;
        self.stats.record_ttl_purge(purged);
        Ok(purged)
    }

    /// Open a forward iterator over `cf_name`, optionally restricted to a
    /// key prefix. The iterator borrows the store's persistent read
    /// transaction; a concurrent write may invalidate it (see
    /// [`CfIterator`]'s docs).
    pub fn iter(&self, cf_name: &str, prefix: Option<Vec<u8>>) -> Result<CfIterator> {
        let cf = self.require_cf(cf_name)?;
        let mut txn = self.txn.lock().unwrap();
        self.begin_with_busy_retry(&mut txn, false)?;
        self.stats.record_iteration_opened();
        CfIterator::open(&self.btree, &cf, prefix)
    }

    /// Request a checkpoint. Requires `NoTx` at the pager level; returns
    /// `Busy` if a write transaction is currently open.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<(i32, i32)> {
        let mut txn = self.txn.lock().unwrap();
        self.run_with_notx(&mut txn, || admin::checkpoint(&self.btree, mode))
    }

    pub fn sync(&self) -> Result<()> {
        self.checkpoint(CheckpointMode::Full).map(|_| ())
    }

    pub fn incremental_vacuum(&self) -> Result<bool> {
        self.with_write(|btree| admin::incremental_vacuum(btree))
    }

    /// Validate page 1, the metadata table, and every CF table recorded in
    /// the metadata table (including reserved TTL indexes and CFs that
    /// aren't currently open in memory).
    pub fn integrity_check(&self, max_errors: i32) -> Result<Vec<String>> {
        let errors = self.with_read(|btree| {
            let mut roots = vec![1, self.meta_root];
            roots.extend(catalog::all_roots(btree, self.meta_root)?);
            admin::integrity_check(btree, &roots, max_errors)
        })?;
        if !errors.is_empty() {
            for err in &errors {
                log_message(LogLevel::Warning, err);
            }
            return Err(Error::with_message(ErrorCode::Corrupt, format!("{} integrity error(s) found", errors.len())));
        }
        Ok(errors)
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    fn record_result<T>(&self, result: &Result<T>, on_success: impl FnOnce(&StoreStats)) {
        match result {
            Ok(_) => on_success(&self.stats),
            Err(_) => self.stats.record_error(),
        }
    }

    pub fn max_probe_depth(&self) -> u32 {
        MAX_META_PROBES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::unix::UnixVfs;

    fn open_memory() -> Store {
        let vfs = UnixVfs::new();
        Store::open(&vfs, ":memory:").unwrap()
    }

    #[test]
    fn open_creates_default_cf() {
        let store = open_memory();
        let cfs = store.list_cf().unwrap();
        assert_eq!(cfs, vec!["default".to_string()]);
    }

    #[test]
    fn put_get_delete_round_trip_on_default_cf() {
        let store = open_memory();
        store.put("default", b"k1", b"v1").unwrap();
        assert_eq!(store.get("default", b"k1").unwrap(), Some(b"v1".to_vec()));
        assert!(store.delete("default", b"k1").unwrap());
        assert_eq!(store.get("default", b"k1").unwrap(), None);
    }

    #[test]
    fn create_open_and_drop_user_cf() {
        let store = open_memory();
        store.create_cf("events", false).unwrap();
        store.put("events", b"k1", b"v1").unwrap();
        assert_eq!(store.get("events", b"k1").unwrap(), Some(b"v1".to_vec()));

        let mut cfs = store.list_cf().unwrap();
        cfs.sort();
        assert_eq!(cfs, vec!["default".to_string(), "events".to_string()]);

        store.drop_cf("events").unwrap();
        assert!(store.get("events", b"k1").is_err());
    }

    #[test]
    fn ttl_cf_reports_expiry() {
        let store = open_memory();
        store.create_cf("sessions", true).unwrap();
        store.put_ttl("sessions", b"s1", b"v", ttl::now_ms() + 60_000).unwrap();
        assert!(store.ttl_remaining("sessions", b"s1").unwrap() > 0);
        store.put_ttl("sessions", b"s2", b"v", 1).unwrap();
        let purged = store.purge_expired("sessions", 100).unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.get("sessions", b"s2").unwrap(), None);
    }

    #[test]
    fn get_lazily_purges_an_elapsed_key_without_explicit_purge_call() {
        let store = open_memory();
        store.create_cf("sessions", true).unwrap();
        store.put_ttl("sessions", b"s1", b"v", 1).unwrap();
        assert_eq!(store.get("sessions", b"s1").unwrap(), None);
        assert_eq!(store.ttl_remaining("sessions", b"s1").unwrap(), NO_TTL);
        assert_eq!(store.purge_expired("sessions", 100).unwrap(), 0);
    }

    #[test]
    fn iteration_sees_committed_keys_with_prefix_filter() {
        let store = open_memory();
        for k in ["apple", "apricot", "banana"] {
            store.put("default", k.as_bytes(), b"v").unwrap();
        }
        let mut it = store.iter("default", Some(b"ap".to_vec())).unwrap();
        it.first().unwrap();
        let mut seen = Vec::new();
        while !it.eof() {
            seen.push(String::from_utf8(it.key().unwrap()).unwrap());
            it.next().unwrap();
        }
        assert_eq!(seen, vec!["apple".to_string(), "apricot".to_string()]);
    }

    #[test]
    fn reopening_existing_store_preserves_default_cf_root() {
        let vfs = UnixVfs::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let path_str = path.to_str().unwrap();

        {
            let store = Store::open(&vfs, path_str).unwrap();
            store.put("default", b"k1", b"v1").unwrap();
        }
        {
            let store = Store::open(&vfs, path_str).unwrap();
            assert_eq!(store.get("default", b"k1").unwrap(), Some(b"v1".to_vec()));
        }
    }

    #[test]
    fn stats_track_operations_and_errors() {
        let store = open_memory();
        store.put("default", b"k1", b"v1").unwrap();
        let _ = store.get("default", b"k1").unwrap();
        assert!(store.get("missing-cf", b"k1").is_err());
        let snap = store.stats();
        assert_eq!(snap.puts, 1);
        assert_eq!(snap.gets, 1);
        assert_eq!(snap.errors, 1);
    }
}
