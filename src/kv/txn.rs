//! Transaction state machine: `NoTx` / `Read` / `Write`, plus the
//! persistent-read optimization that keeps a read transaction open between
//! API calls so hot point-lookup paths don't pay `begin_trans`/`commit` on
//! every call.
//!
//! The read→write upgrade can never happen in place (the persistent read
//! may hold the WAL checkpoint slot), so [`TxnManager::begin`] always
//! commits the outgoing read before opening the write. This is the one
//! rule every caller in `kv` must go through this type to get right.

use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::btree::{Btree, TransState};

/// Owns the single transaction active against one store.
pub struct TxnManager {
    btree: Arc<Btree>,
    state: TransState,
    commits_since_checkpoint: u32,
}

impl TxnManager {
    pub fn new(btree: Arc<Btree>) -> Self {
        Self {
            btree,
            state: TransState::None,
            commits_since_checkpoint: 0,
        }
    }

    pub fn state(&self) -> TransState {
        self.state
    }

    pub fn is_write(&self) -> bool {
        self.state == TransState::Write
    }

    /// `begin(write=false)`: noop in `Read`, starts a read from `NoTx`.
    /// `begin(write=true)`: commits an outgoing persistent read first.
    /// Either call fails with `Error` if a write transaction is already open.
    pub fn begin(&mut self, write: bool) -> Result<()> {
        match (self.state, write) {
            (TransState::Write, _) => Err(Error::with_message(
                ErrorCode::Error,
                "a write transaction is already active",
            )),
            (TransState::Read, false) => Ok(()),
            (TransState::Read, true) => {
                self.btree.commit()?;
                self.state = TransState::None;
                self.btree.begin_trans(true)?;
                self.state = TransState::Write;
                Ok(())
            }
            (TransState::None, write) => {
                self.btree.begin_trans(write)?;
                self.state = if write {
                    TransState::Write
                } else {
                    TransState::Read
                };
                Ok(())
            }
        }
    }

    /// Commit the current transaction and immediately reopen the persistent
    /// read. Returns `true` if the committed transaction was a write (the
    /// caller uses this to drive the WAL-size auto-checkpoint counter).
    pub fn commit(&mut self) -> Result<bool> {
        self.btree.commit()?;
        let was_write = self.state == TransState::Write;
        self.state = TransState::None;
        if was_write {
            self.commits_since_checkpoint += 1;
        }
        self.begin(false)?;
        Ok(was_write)
    }

    /// Roll back the current transaction. `reopen` is `false` only when the
    /// store is closing.
    pub fn rollback(&mut self, reopen: bool) -> Result<()> {
        self.btree.rollback(0, false)?;
        self.state = TransState::None;
        if reopen {
            self.begin(false)?;
        }
        Ok(())
    }

    /// Release the persistent read (if any) so a `NoTx`-only pager
    /// primitive (checkpoint, integrity check) can run. Fails `Busy` if a
    /// write transaction is active. Returns whether a read was released
    /// (and should be reopened via [`TxnManager::reopen_persistent_read`]
    /// once the primitive has run).
    pub fn release_for_notx(&mut self) -> Result<bool> {
        match self.state {
            TransState::Write => Err(Error::new(ErrorCode::Busy)),
            TransState::Read => {
                self.rollback(false)?;
                Ok(true)
            }
            TransState::None => Ok(false),
        }
    }

    pub fn reopen_persistent_read(&mut self) -> Result<()> {
        if self.state == TransState::None {
            self.begin(false)?;
        }
        Ok(())
    }

    /// Run `f` inside an auto-commit write transaction: begin if needed,
    /// run `f`, commit on success, roll back and still restore the
    /// persistent read on failure.
    pub fn with_auto_write<T>(&mut self, f: impl FnOnce(&Arc<Btree>) -> Result<T>) -> Result<T> {
        self.begin(true)?;
        match f(&self.btree) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.rollback(true);
                Err(err)
            }
        }
    }

    /// Number of write commits since the last [`TxnManager::take_commit_count`].
    pub fn commits_since_checkpoint(&self) -> u32 {
        self.commits_since_checkpoint
    }

    pub fn take_commit_count(&mut self) -> u32 {
        let n = self.commits_since_checkpoint;
        self.commits_since_checkpoint = 0;
        n
    }

    pub fn btree(&self) -> &Arc<Btree> {
        &self.btree
    }
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
    fn begin_read_is_idempotent() {
        let mut txn = TxnManager::new(memory_btree());
        txn.begin(false).unwrap();
        txn.begin(false).unwrap();
        assert_eq!(txn.state(), TransState::Read);
    }

    #[test]
    fn upgrading_read_to_write_commits_first() {
        let mut txn = TxnManager::new(memory_btree());
        txn.begin(false).unwrap();
        txn.begin(true).unwrap();
        assert_eq!(txn.state(), TransState::Write);
    }

    #[test]
    fn second_write_is_rejected() {
        let mut txn = TxnManager::new(memory_btree());
        txn.begin(true).unwrap();
        assert!(txn.begin(true).is_err());
    }

    #[test]
    fn commit_reopens_persistent_read() {
        let mut txn = TxnManager::new(memory_btree());
        txn.begin(true).unwrap();
        let was_write = txn.commit().unwrap();
        assert!(was_write);
        assert_eq!(txn.state(), TransState::Read);
    }

    #[test]
    fn auto_write_restores_persistent_read_on_error() {
        let mut txn = TxnManager::new(memory_btree());
        txn.begin(false).unwrap();
        let result: Result<()> = txn.with_auto_write(|_btree| {
            Err(Error::with_message(ErrorCode::Error, "boom"))
        });
        assert!(result.is_err());
        assert_eq!(txn.state(), TransState::Read);
    }
}
