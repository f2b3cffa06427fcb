//! Storage layer: B-tree, pager, WAL, and page cache

pub mod btree;
pub mod pager;
pub mod pcache;
pub mod wal;
