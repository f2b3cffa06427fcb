//! Unix VFS implementation
//!
//! Provides file and OS operations for Unix-like platforms, backing the
//! generic `Vfs`/`VfsFile` traits the pager and B-tree are built against.

use crate::error::{Error, ErrorCode, Result};
use crate::types::{
    AccessFlags, ByteCount, DbOffset, DeviceCharacteristics, LockLevel, OpenFlags, SyncFlags, Vfs,
    VfsFile,
};
use std::ffi::CString;
use std::os::unix::io::RawFd;

// ============================================================================
// Platform-specific helpers
// ============================================================================

/// Get errno in a cross-platform way (Linux vs macOS/BSD)
#[cfg(target_os = "linux")]
fn get_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(not(target_os = "linux"))]
fn get_errno() -> i32 {
    unsafe { *libc::__error() }
}

/// fdatasync - use fsync on platforms without fdatasync (macOS)
#[cfg(target_os = "linux")]
unsafe fn platform_fdatasync(fd: RawFd) -> i32 {
    libc::fdatasync(fd)
}

#[cfg(not(target_os = "linux"))]
unsafe fn platform_fdatasync(fd: RawFd) -> i32 {
    libc::fsync(fd)
}

fn error_from_errno() -> Error {
    let errno = get_errno();
    let msg = std::io::Error::from_raw_os_error(errno).to_string();

    let code = match errno {
        libc::ENOENT => ErrorCode::CantOpen,
        libc::EACCES | libc::EPERM => ErrorCode::Perm,
        libc::ENOSPC | libc::EDQUOT => ErrorCode::Full,
        libc::EBUSY | libc::EAGAIN => ErrorCode::Busy,
        libc::EINTR => ErrorCode::Interrupt,
        libc::ENOMEM => ErrorCode::NoMem,
        libc::EROFS => ErrorCode::ReadOnly,
        _ => ErrorCode::IoErr,
    };

    Error::with_message(code, msg)
}

// ============================================================================
// Unix VFS
// ============================================================================

/// Unix VFS implementation
#[derive(Clone)]
pub struct UnixVfs {
    name: String,
}

impl UnixVfs {
    /// Create a new Unix VFS with the default name "unix"
    pub fn new() -> Self {
        Self {
            name: "unix".to_string(),
        }
    }

    /// Create a new Unix VFS with a custom name
    pub fn new_with_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn detect_device_characteristics(&self, _fd: RawFd) -> DeviceCharacteristics {
        DeviceCharacteristics::POWERSAFE_OVERWRITE
    }
}

impl Default for UnixVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for UnixVfs {
    type File = UnixFile;

    fn open(&self, path: &str, flags: OpenFlags) -> Result<Self::File> {
        let mut oflags: libc::c_int = 0;

        if flags.contains(OpenFlags::READONLY) {
            oflags |= libc::O_RDONLY;
        } else if flags.contains(OpenFlags::READWRITE) {
            oflags |= libc::O_RDWR;
        }

        if flags.contains(OpenFlags::CREATE) {
            oflags |= libc::O_CREAT;
        }

        if flags.contains(OpenFlags::EXCLUSIVE) {
            oflags |= libc::O_EXCL;
        }

        let c_path = CString::new(path).map_err(|_| Error::new(ErrorCode::CantOpen))?;
        let fd = unsafe { libc::open(c_path.as_ptr(), oflags, 0o644) };
        if fd < 0 {
            return Err(error_from_errno());
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            unsafe { libc::close(fd) };
            return Err(error_from_errno());
        }

        let delete_on_close = flags.contains(OpenFlags::DELETEONCLOSE);

        Ok(UnixFile {
            fd,
            path: path.to_string(),
            lock_level: LockLevel::None,
            sector_size: 4096,
            device_chars: self.detect_device_characteristics(fd),
            delete_on_close,
        })
    }

    fn delete(&self, path: &str, sync_dir: bool) -> Result<()> {
        let c_path = CString::new(path).map_err(|_| Error::new(ErrorCode::CantOpen))?;
        let rc = unsafe { libc::unlink(c_path.as_ptr()) };

        if rc != 0 {
            let errno = get_errno();
            if errno != libc::ENOENT {
                return Err(error_from_errno());
            }
        }

        if sync_dir {
            if let Some(dir_path) = std::path::Path::new(path).parent() {
                let dir_str = dir_path.to_str().unwrap_or(".");
                if let Ok(c_dir) = CString::new(dir_str) {
                    let dir_fd = unsafe { libc::open(c_dir.as_ptr(), libc::O_RDONLY) };
                    if dir_fd >= 0 {
                        unsafe {
                            libc::fsync(dir_fd);
                            libc::close(dir_fd);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn access(&self, path: &str, flags: AccessFlags) -> Result<bool> {
        let c_path = CString::new(path).map_err(|_| Error::new(ErrorCode::CantOpen))?;

        let mode = if flags.contains(AccessFlags::READWRITE) {
            libc::R_OK | libc::W_OK
        } else if flags.contains(AccessFlags::READ) {
            libc::R_OK
        } else {
            libc::F_OK
        };

        let rc = unsafe { libc::access(c_path.as_ptr(), mode) };
        Ok(rc == 0)
    }

    fn full_pathname(&self, path: &str) -> Result<String> {
        const MAX_PATHNAME: usize = 512;
        let c_path = CString::new(path).map_err(|_| Error::new(ErrorCode::CantOpen))?;
        let mut buf = vec![0i8; MAX_PATHNAME];

        let result = unsafe { libc::realpath(c_path.as_ptr(), buf.as_mut_ptr()) };

        if result.is_null() {
            if path.starts_with('/') {
                return Ok(path.to_string());
            }
            let cwd = std::env::current_dir().map_err(|_| Error::new(ErrorCode::CantOpen))?;
            return Ok(cwd.join(path).to_string_lossy().to_string());
        }

        let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        Ok(
            String::from_utf8_lossy(&buf[..len].iter().map(|&c| c as u8).collect::<Vec<u8>>())
                .to_string(),
        )
    }

    fn randomness(&self, buf: &mut [u8]) -> i32 {
        if let Ok(mut file) = std::fs::File::open("/dev/urandom") {
            use std::io::Read;
            if file.read_exact(buf).is_ok() {
                return buf.len() as i32;
            }
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let seed = now.as_nanos() as u64;

        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = ((seed >> ((i % 8) * 8)) ^ (seed.wrapping_mul(i as u64 + 1))) as u8;
        }

        buf.len() as i32
    }

    fn sleep(&self, microseconds: i32) -> i32 {
        std::thread::sleep(std::time::Duration::from_micros(microseconds as u64));
        microseconds
    }

    fn current_time(&self) -> f64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();

        const UNIX_EPOCH_JD: f64 = 2440587.5;
        UNIX_EPOCH_JD + (now.as_secs_f64() / 86400.0)
    }

    fn current_time_i64(&self) -> i64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();

        const UNIX_EPOCH_JD_MS: i64 = 210866760000000;
        UNIX_EPOCH_JD_MS + (now.as_millis() as i64)
    }
}

// ============================================================================
// Unix File Handle
// ============================================================================

/// Unix file handle
pub struct UnixFile {
    fd: RawFd,
    path: String,
    lock_level: LockLevel,
    sector_size: i32,
    device_chars: DeviceCharacteristics,
    delete_on_close: bool,
}

unsafe impl Send for UnixFile {}

impl Drop for UnixFile {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };

        if self.delete_on_close {
            if let Ok(c_path) = CString::new(self.path.as_str()) {
                unsafe { libc::unlink(c_path.as_ptr()) };
            }
        }
    }
}

impl UnixFile {
    fn lock_posix(&mut self, new_lock: LockLevel) -> Result<()> {
        let l_type: libc::c_short = match new_lock {
            LockLevel::Shared => libc::F_RDLCK as libc::c_short,
            LockLevel::Exclusive | LockLevel::Reserved | LockLevel::Pending => {
                libc::F_WRLCK as libc::c_short
            }
            LockLevel::None => libc::F_UNLCK as libc::c_short,
        };

        let flock = libc::flock {
            l_type,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };

        loop {
            let rc = unsafe { libc::fcntl(self.fd, libc::F_SETLK, &flock) };
            if rc == 0 {
                self.lock_level = new_lock;
                return Ok(());
            }

            let errno = get_errno();
            if errno == libc::EINTR {
                continue;
            }

            if errno == libc::EAGAIN || errno == libc::EACCES {
                return Err(Error::new(ErrorCode::Busy));
            }

            return Err(error_from_errno());
        }
    }
}

impl VfsFile for UnixFile {
    fn read(&mut self, buf: &mut [u8], offset: DbOffset) -> Result<ByteCount> {
        let n = unsafe {
            libc::pread(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };

        if n < 0 {
            return Err(error_from_errno());
        }

        let n = n as usize;
        if n < buf.len() {
            buf[n..].fill(0);
        }

        Ok(n)
    }

    fn write(&mut self, buf: &[u8], offset: DbOffset) -> Result<()> {
        let n = unsafe {
            libc::pwrite(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };

        if n < 0 {
            return Err(error_from_errno());
        }

        if n as usize != buf.len() {
            return Err(Error::new(ErrorCode::Full));
        }

        Ok(())
    }

    fn truncate(&mut self, size: DbOffset) -> Result<()> {
        let rc = unsafe { libc::ftruncate(self.fd, size as libc::off_t) };
        if rc != 0 {
            return Err(error_from_errno());
        }
        Ok(())
    }

    fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        let rc = if flags.contains(SyncFlags::DATAONLY) {
            unsafe { platform_fdatasync(self.fd) }
        } else {
            unsafe { libc::fsync(self.fd) }
        };

        if rc != 0 {
            return Err(error_from_errno());
        }
        Ok(())
    }

    fn file_size(&self) -> Result<DbOffset> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(self.fd, &mut stat) };
        if rc != 0 {
            return Err(error_from_errno());
        }
        Ok(stat.st_size as DbOffset)
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        let current = self.lock_level;

        if level <= current {
            return Ok(());
        }

        if current == LockLevel::None && level != LockLevel::Shared {
            return Err(Error::new(ErrorCode::Misuse));
        }

        self.lock_posix(level)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        if level >= self.lock_level {
            return Ok(());
        }

        self.lock_posix(level)
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        if self.lock_level >= LockLevel::Reserved {
            return Ok(true);
        }

        let mut flock = libc::flock {
            l_type: libc::F_WRLCK as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: 0,
            l_len: 1,
            l_pid: 0,
        };

        let rc = unsafe { libc::fcntl(self.fd, libc::F_GETLK, &mut flock) };
        if rc != 0 {
            return Err(error_from_errno());
        }

        Ok(flock.l_type != libc::F_UNLCK as libc::c_short)
    }

    fn sector_size(&self) -> i32 {
        self.sector_size
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        self.device_chars
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_vfs_name() {
        let vfs = UnixVfs::new();
        assert_eq!(vfs.name(), "unix");
    }

    #[test]
    fn test_unix_vfs_custom_name() {
        let vfs = UnixVfs::new_with_name("custom-unix");
        assert_eq!(vfs.name(), "custom-unix");
    }

    #[test]
    fn test_unix_vfs_randomness() {
        let vfs = UnixVfs::new();
        let mut buf1 = [0u8; 16];
        let mut buf2 = [0u8; 16];

        let n1 = vfs.randomness(&mut buf1);
        let n2 = vfs.randomness(&mut buf2);

        assert_eq!(n1, 16);
        assert_eq!(n2, 16);
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_unix_vfs_current_time() {
        let vfs = UnixVfs::new();
        let jd = vfs.current_time();

        assert!(jd > 2400000.0);
        assert!(jd < 2500000.0);
    }

    #[test]
    fn test_unix_vfs_sleep() {
        let vfs = UnixVfs::new();
        let start = std::time::Instant::now();
        let result = vfs.sleep(10000);
        let elapsed = start.elapsed();

        assert_eq!(result, 10000);
        assert!(elapsed >= std::time::Duration::from_micros(10000));
    }

    #[test]
    fn test_unix_vfs_access_nonexistent() {
        let vfs = UnixVfs::new();
        let result = vfs.access("/nonexistent/path/to/file", AccessFlags::EXISTS);
        assert!(result.is_ok());
        assert!(!result.unwrap());
    }

    #[test]
    fn test_unix_vfs_full_pathname_absolute() {
        let vfs = UnixVfs::new();
        let result = vfs.full_pathname("/tmp");
        assert!(result.is_ok());
        let path = result.unwrap();
        assert!(path.starts_with('/'));
    }

    #[test]
    fn test_unix_file_open_close() {
        let vfs = UnixVfs::new();
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::DELETEONCLOSE;

        let file = vfs.open("/tmp/snkv_test_file.db", flags);
        assert!(file.is_ok());
    }

    #[test]
    fn test_unix_file_read_write() {
        let vfs = UnixVfs::new();
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::DELETEONCLOSE;

        let mut file = vfs.open("/tmp/snkv_test_rw.db", flags).unwrap();

        let data = b"hello, storage engine";
        file.write(data, 0).unwrap();

        let mut buf = [0u8; 22];
        let read = file.read(&mut buf, 0).unwrap();
        assert_eq!(read, 22);
        assert_eq!(&buf, data);
    }

    #[test]
    fn test_unix_file_truncate() {
        let vfs = UnixVfs::new();
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::DELETEONCLOSE;

        let mut file = vfs.open("/tmp/snkv_test_trunc.db", flags).unwrap();

        let data = b"hello, storage engine";
        file.write(data, 0).unwrap();
        file.truncate(5).unwrap();

        let size = file.file_size().unwrap();
        assert_eq!(size, 5);
    }

    #[test]
    fn test_unix_file_locking() {
        let vfs = UnixVfs::new();
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::DELETEONCLOSE;

        let mut file = vfs.open("/tmp/snkv_test_lock.db", flags).unwrap();

        assert!(file.lock(LockLevel::Shared).is_ok());
        assert!(file.lock(LockLevel::Reserved).is_ok());
        assert!(file.lock(LockLevel::Exclusive).is_ok());
        assert!(file.unlock(LockLevel::Shared).is_ok());
        assert!(file.unlock(LockLevel::None).is_ok());
    }
}
