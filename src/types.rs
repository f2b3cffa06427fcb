//! Core type aliases and traits shared across the storage engine.

use bitflags::bitflags;

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// Page number type
pub type Pgno = u32;

/// Row ID type used by the underlying B-tree (integer keys in the catalog table)
pub type RowId = i64;

/// Database file offset
pub type DbOffset = i64;

/// Byte count type
pub type ByteCount = usize;

/// Transaction counter
pub type TxnId = u32;

// ============================================================================
// VFS Flags and Types
// ============================================================================

bitflags! {
    /// File open flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READONLY       = 0x00000001;
        const READWRITE      = 0x00000002;
        const CREATE         = 0x00000004;
        const DELETEONCLOSE  = 0x00000008;
        const EXCLUSIVE      = 0x00000010;
        const AUTOPROXY      = 0x00000020;
        const URI            = 0x00000040;
        const MEMORY         = 0x00000080;
        const MAIN_DB        = 0x00000100;
        const TEMP_DB        = 0x00000200;
        const TRANSIENT_DB   = 0x00000400;
        const MAIN_JOURNAL   = 0x00000800;
        const TEMP_JOURNAL   = 0x00001000;
        const SUBJOURNAL     = 0x00002000;
        const SUPER_JOURNAL  = 0x00004000;
        const NOMUTEX        = 0x00008000;
        const FULLMUTEX      = 0x00010000;
        const SHAREDCACHE    = 0x00020000;
        const PRIVATECACHE   = 0x00040000;
        const WAL            = 0x00080000;
        const NOFOLLOW       = 0x01000000;
        const EXRESCODE      = 0x02000000;
    }

    /// Sync flags for VfsFile::sync()
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncFlags: u32 {
        const NORMAL   = 0x00002;
        const FULL     = 0x00003;
        const DATAONLY = 0x00010;
    }

    /// Access check flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const EXISTS    = 0;
        const READWRITE = 1;
        const READ      = 2;
    }

    /// Device characteristics
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceCharacteristics: u32 {
        const ATOMIC                 = 0x00000001;
        const ATOMIC512              = 0x00000002;
        const ATOMIC1K               = 0x00000004;
        const ATOMIC2K               = 0x00000008;
        const ATOMIC4K               = 0x00000010;
        const ATOMIC8K               = 0x00000020;
        const ATOMIC16K              = 0x00000040;
        const ATOMIC32K              = 0x00000080;
        const ATOMIC64K              = 0x00000100;
        const SAFE_APPEND            = 0x00000200;
        const SEQUENTIAL             = 0x00000400;
        const UNDELETABLE_WHEN_OPEN  = 0x00000800;
        const POWERSAFE_OVERWRITE    = 0x00001000;
        const IMMUTABLE              = 0x00002000;
        const BATCH_ATOMIC           = 0x00004000;
    }
}

/// Lock levels for file locking
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum LockLevel {
    /// No lock held
    None = 0,
    /// Shared (read) lock
    Shared = 1,
    /// Reserved lock (preparing to write)
    Reserved = 2,
    /// Pending lock (waiting for exclusive)
    Pending = 3,
    /// Exclusive (write) lock
    Exclusive = 4,
}

// ============================================================================
// Traits
// ============================================================================

/// Opaque handle identifying the store that owns a B-tree connection.
///
/// The B-tree layer only needs this for locking bookkeeping (which `Btree`
/// handle is attached to `BtShared`) - it never calls methods on it.
pub trait ConnectionHandle: Send + Sync {}

/// Virtual filesystem abstraction
pub trait Vfs: Send + Sync {
    /// The file type this VFS produces
    type File: VfsFile;

    /// Open a file
    fn open(&self, path: &str, flags: OpenFlags) -> crate::error::Result<Self::File>;

    /// Delete a file
    fn delete(&self, path: &str, sync_dir: bool) -> crate::error::Result<()>;

    /// Check file accessibility
    fn access(&self, path: &str, flags: AccessFlags) -> crate::error::Result<bool>;

    /// Convert to full pathname
    fn full_pathname(&self, path: &str) -> crate::error::Result<String>;

    /// Fill buffer with random bytes, returns bytes written
    fn randomness(&self, buf: &mut [u8]) -> i32;

    /// Sleep for microseconds, returns actual sleep time
    fn sleep(&self, microseconds: i32) -> i32;

    /// Current time as Julian day number
    fn current_time(&self) -> f64;

    /// Current time with millisecond precision (ms since Unix epoch)
    fn current_time_i64(&self) -> i64;
}

/// File operations trait
pub trait VfsFile: Send {
    /// Read data at offset, returns bytes read
    fn read(&mut self, buf: &mut [u8], offset: DbOffset) -> crate::error::Result<usize>;

    /// Write data at offset
    fn write(&mut self, buf: &[u8], offset: DbOffset) -> crate::error::Result<()>;

    /// Truncate file to size
    fn truncate(&mut self, size: DbOffset) -> crate::error::Result<()>;

    /// Sync file to disk
    fn sync(&mut self, flags: SyncFlags) -> crate::error::Result<()>;

    /// Get file size
    fn file_size(&self) -> crate::error::Result<DbOffset>;

    /// Acquire lock at level
    fn lock(&mut self, level: LockLevel) -> crate::error::Result<()>;

    /// Release lock to level
    fn unlock(&mut self, level: LockLevel) -> crate::error::Result<()>;

    /// Check if reserved lock is held by another process
    fn check_reserved_lock(&self) -> crate::error::Result<bool>;

    /// Sector size (minimum atomic write unit)
    fn sector_size(&self) -> i32;

    /// Device characteristics flags
    fn device_characteristics(&self) -> DeviceCharacteristics;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_level_ordering() {
        assert!(LockLevel::None < LockLevel::Shared);
        assert!(LockLevel::Shared < LockLevel::Reserved);
        assert!(LockLevel::Reserved < LockLevel::Pending);
        assert!(LockLevel::Pending < LockLevel::Exclusive);
    }

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE;
        assert!(flags.contains(OpenFlags::READWRITE));
        assert!(flags.contains(OpenFlags::CREATE));
        assert!(!flags.contains(OpenFlags::READONLY));
    }
}
