//! Embedded transactional key-value store built on the paged B-tree.
//!
//! `kv` never touches pages, frames, or file descriptors directly; it
//! consumes `storage::btree`/`storage::pager` as a stable internal API
//! (create/drop table, cursor, seek, insert/delete, meta slots,
//! checkpoint, integrity check) the same way the rest of this crate's
//! storage layer is consumed from above.

pub mod admin;
pub mod catalog;
pub mod cf;
pub mod codec;
pub mod cursor;
pub mod iter;
pub mod ops;
pub mod store;
pub mod ttl;
pub mod txn;

pub use admin::{CheckpointMode, StoreStats};
pub use cf::CfHandle;
pub use iter::CfIterator;
pub use store::{JournalMode, Store, StoreOptions, SyncLevel};

/// Maximum key length, in bytes.
pub const MAX_KEY_LEN: usize = 64 * 1024;
/// Maximum value length, in bytes.
pub const MAX_VALUE_LEN: usize = 10 * 1024 * 1024;
/// Maximum column-family name length, in bytes.
pub const MAX_CF_NAME_LEN: usize = 255;
/// Maximum linear-probe chain length before the metadata table reports `Full`.
pub const MAX_META_PROBES: u32 = 64;
/// Sentinel returned by `ttl_remaining` for a key that carries no TTL.
pub const NO_TTL: i64 = -1;
/// Name of the column family every store opens implicitly.
pub const DEFAULT_CF: &str = "default";
/// Prefix that marks a column family as internal bookkeeping, invisible to
/// `list_cf`/`open_cf`/`create_cf`.
pub const RESERVED_PREFIX: &str = "__";

use std::sync::Arc;

use crate::os::mutex::{mutex_enter, mutex_leave, RecursiveMutex};

/// RAII guard around [`RecursiveMutex`]'s `enter`/`leave` free functions.
/// `kv` is the first caller that needs the mutex held across more than one
/// statement, so this is the one place that wraps it.
pub(crate) struct MutexGuard<'a> {
    mutex: Option<&'a Arc<RecursiveMutex>>,
}

impl<'a> MutexGuard<'a> {
    pub(crate) fn acquire(mutex: Option<&'a Arc<RecursiveMutex>>) -> Self {
        mutex_enter(mutex);
        Self { mutex }
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        mutex_leave(self.mutex);
    }
}
