//! snkv - an embedded, transactional key-value storage engine.
//!
//! The engine keeps ordered byte-string keys and opaque values in a single
//! file, grouped into column families, with crash-safe durability provided
//! by a write-ahead log sitting underneath a paged B-tree.

// Many storage-layer components are implemented ahead of the modules that
// wire them together; allow dead code until the kv layer lands on top.
#![allow(dead_code)]

pub mod config;
pub mod error;
pub mod kv;
pub mod os;
pub mod storage;
pub mod types;
pub mod util;

pub use error::{Error, ErrorCode, Result};
pub use kv::{CfHandle, CfIterator, JournalMode, Store, StoreOptions, SyncLevel};
