//! Windows VFS implementation
//!
//! Provides file and OS operations for Windows, backing the generic
//! `Vfs`/`VfsFile` traits the pager and B-tree are built against.

use crate::error::{Error, ErrorCode, Result};
use crate::types::{
    AccessFlags, ByteCount, DbOffset, DeviceCharacteristics, LockLevel, OpenFlags, SyncFlags, Vfs,
    VfsFile,
};
use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Foundation::{
    ERROR_ACCESS_DENIED, ERROR_DISK_FULL, ERROR_FILE_NOT_FOUND, ERROR_HANDLE_EOF,
    ERROR_INVALID_PARAMETER, ERROR_IO_PENDING, ERROR_LOCK_VIOLATION, ERROR_PATH_NOT_FOUND,
    ERROR_SHARING_VIOLATION, ERROR_WRITE_PROTECT,
};
use windows_sys::Win32::Security::Cryptography::{
    CryptAcquireContextW, CryptGenRandom, CryptReleaseContext, CRYPT_VERIFYCONTEXT, PROV_RSA_FULL,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, DeleteFileW, FlushFileBuffers, GetFileAttributesW, GetFileSizeEx,
    GetFullPathNameW, LockFileEx, ReadFile, SetEndOfFile, SetFilePointerEx, UnlockFileEx,
    WriteFile, CREATE_ALWAYS, CREATE_NEW, FILE_ATTRIBUTE_NORMAL, FILE_BEGIN,
    FILE_FLAG_DELETE_ON_CLOSE, FILE_FLAG_OVERLAPPED, FILE_FLAG_RANDOM_ACCESS, FILE_SHARE_DELETE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_ALWAYS, OPEN_EXISTING,
};
use windows_sys::Win32::System::SystemInformation::GetSystemTimeAsFileTime;
use windows_sys::Win32::System::Threading::Sleep;
use windows_sys::Win32::System::IO::{
    GetOverlappedResult, OVERLAPPED, OVERLAPPED_0, OVERLAPPED_0_0,
};

// ============================================================================
// Windows constants
// ============================================================================

const MAX_PATH_LEN: usize = 260;
const FILE_SHARE_FLAGS: u32 = FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE;

const PENDING_BYTE: u32 = 0x4000_0000;
const RESERVED_BYTE: u32 = PENDING_BYTE + 1;
const SHARED_FIRST: u32 = PENDING_BYTE + 2;
const SHARED_SIZE: u32 = 510;
const NO_SHARED_LOCK: u8 = 0xFF;

// ============================================================================
// Windows VFS
// ============================================================================

/// Windows VFS implementation
#[derive(Clone)]
pub struct WinVfs {
    name: String,
}

impl WinVfs {
    /// Create a new Windows VFS with the default name "win32"
    pub fn new() -> Self {
        Self {
            name: "win32".to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn error_from_win32_code(code: u32) -> Error {
        let msg = std::io::Error::from_raw_os_error(code as i32).to_string();
        let mapped = match code {
            ERROR_ACCESS_DENIED => ErrorCode::Perm,
            ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => ErrorCode::CantOpen,
            ERROR_DISK_FULL => ErrorCode::Full,
            ERROR_WRITE_PROTECT => ErrorCode::ReadOnly,
            ERROR_LOCK_VIOLATION | ERROR_SHARING_VIOLATION => ErrorCode::Busy,
            ERROR_INVALID_PARAMETER => ErrorCode::Misuse,
            _ => ErrorCode::IoErr,
        };

        Error::with_message(mapped, msg)
    }

    fn error_from_win32() -> Error {
        let code = unsafe { GetLastError() };
        Self::error_from_win32_code(code)
    }

    fn to_utf16(path: &str) -> Vec<u16> {
        OsStr::new(path)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect()
    }
}

impl Default for WinVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for WinVfs {
    type File = WinFile;

    fn open(&self, path: &str, flags: OpenFlags) -> Result<Self::File> {
        let desired_access = if flags.contains(OpenFlags::READONLY) {
            GENERIC_READ
        } else {
            GENERIC_READ | GENERIC_WRITE
        };

        let mut attributes = FILE_ATTRIBUTE_NORMAL | FILE_FLAG_RANDOM_ACCESS | FILE_FLAG_OVERLAPPED;

        if flags.contains(OpenFlags::DELETEONCLOSE) {
            attributes |= FILE_FLAG_DELETE_ON_CLOSE;
        }

        let creation = if flags.contains(OpenFlags::CREATE) {
            if flags.contains(OpenFlags::EXCLUSIVE) {
                CREATE_NEW
            } else {
                OPEN_ALWAYS
            }
        } else if flags.contains(OpenFlags::EXCLUSIVE) {
            CREATE_ALWAYS
        } else {
            OPEN_EXISTING
        };

        let wide_path = Self::to_utf16(path);
        let handle = unsafe {
            CreateFileW(
                wide_path.as_ptr(),
                desired_access,
                FILE_SHARE_FLAGS,
                std::ptr::null(),
                creation,
                attributes,
                0,
            )
        };

        if handle == INVALID_HANDLE_VALUE {
            return Err(Self::error_from_win32());
        }

        Ok(WinFile {
            handle,
            path: path.to_string(),
            lock_level: LockLevel::None,
            shared_lock_byte: NO_SHARED_LOCK,
            sector_size: 4096,
            device_chars: DeviceCharacteristics::POWERSAFE_OVERWRITE,
            delete_on_close: flags.contains(OpenFlags::DELETEONCLOSE),
        })
    }

    fn delete(&self, path: &str, _sync_dir: bool) -> Result<()> {
        let wide_path = Self::to_utf16(path);

        for _ in 0..3 {
            let rc = unsafe { DeleteFileW(wide_path.as_ptr()) };
            if rc != 0 {
                return Ok(());
            }

            let err = unsafe { GetLastError() };
            if err == ERROR_FILE_NOT_FOUND {
                return Ok(());
            }
            if err != ERROR_SHARING_VIOLATION {
                return Err(Self::error_from_win32_code(err));
            }

            std::thread::sleep(std::time::Duration::from_millis(100));
        }

        Err(Self::error_from_win32())
    }

    fn access(&self, path: &str, flags: AccessFlags) -> Result<bool> {
        let wide_path = Self::to_utf16(path);
        let attrs = unsafe { GetFileAttributesW(wide_path.as_ptr()) };

        if attrs == windows_sys::Win32::Storage::FileSystem::INVALID_FILE_ATTRIBUTES {
            let err = unsafe { GetLastError() };
            if err == ERROR_FILE_NOT_FOUND || err == ERROR_PATH_NOT_FOUND {
                return Ok(false);
            }
            return Err(Self::error_from_win32_code(err));
        }

        if flags.contains(AccessFlags::READWRITE) {
            let readonly =
                (attrs & windows_sys::Win32::Storage::FileSystem::FILE_ATTRIBUTE_READONLY) != 0;
            return Ok(!readonly);
        }

        Ok(true)
    }

    fn full_pathname(&self, path: &str) -> Result<String> {
        let wide_path = Self::to_utf16(path);
        let mut buf = vec![0u16; MAX_PATH_LEN];

        let mut len = unsafe {
            GetFullPathNameW(
                wide_path.as_ptr(),
                buf.len() as u32,
                buf.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        };

        if len == 0 {
            return Err(Self::error_from_win32());
        }

        if len as usize >= buf.len() {
            buf.resize(len as usize + 1, 0);
            len = unsafe {
                GetFullPathNameW(
                    wide_path.as_ptr(),
                    buf.len() as u32,
                    buf.as_mut_ptr(),
                    std::ptr::null_mut(),
                )
            };
            if len == 0 {
                return Err(Self::error_from_win32());
            }
        }

        Ok(String::from_utf16_lossy(&buf[..len as usize]))
    }

    fn randomness(&self, buf: &mut [u8]) -> i32 {
        unsafe {
            let mut prov: usize = 0;
            if CryptAcquireContextW(
                &mut prov as *mut _,
                std::ptr::null(),
                std::ptr::null(),
                PROV_RSA_FULL,
                CRYPT_VERIFYCONTEXT,
            ) != 0
            {
                let rc = CryptGenRandom(prov, buf.len() as u32, buf.as_mut_ptr());
                CryptReleaseContext(prov, 0);
                if rc != 0 {
                    return buf.len() as i32;
                }
            }
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let seed = now.as_nanos() as u64;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = ((seed >> ((i % 8) * 8)) ^ (i as u64)) as u8;
        }
        buf.len() as i32
    }

    fn sleep(&self, microseconds: i32) -> i32 {
        let milliseconds = (microseconds + 999) / 1000;
        unsafe { Sleep(milliseconds as u32) };
        milliseconds * 1000
    }

    fn current_time(&self) -> f64 {
        let mut ft = windows_sys::Win32::Foundation::FILETIME {
            dwLowDateTime: 0,
            dwHighDateTime: 0,
        };
        unsafe { GetSystemTimeAsFileTime(&mut ft) };

        let ft64 = ((ft.dwHighDateTime as u64) << 32) | (ft.dwLowDateTime as u64);

        const JD_2000: f64 = 2451545.0;
        const FILETIME_2000: u64 = 125911584000000000;
        JD_2000 + ((ft64 as f64 - FILETIME_2000 as f64) / 864000000000.0)
    }

    fn current_time_i64(&self) -> i64 {
        let mut ft = windows_sys::Win32::Foundation::FILETIME {
            dwLowDateTime: 0,
            dwHighDateTime: 0,
        };
        unsafe { GetSystemTimeAsFileTime(&mut ft) };

        let ft64 = ((ft.dwHighDateTime as u64) << 32) | (ft.dwLowDateTime as u64);

        const FILETIME_JD_OFFSET: i64 = 210866760000000;
        const FILETIME_MS_FACTOR: u64 = 10000;

        FILETIME_JD_OFFSET + (ft64 / FILETIME_MS_FACTOR) as i64
    }
}

// ============================================================================
// Windows File Handle
// ============================================================================

/// Windows file handle
pub struct WinFile {
    handle: HANDLE,
    path: String,
    lock_level: LockLevel,
    shared_lock_byte: u8,
    sector_size: i32,
    device_chars: DeviceCharacteristics,
    delete_on_close: bool,
}

unsafe impl Send for WinFile {}

impl Drop for WinFile {
    fn drop(&mut self) {
        unsafe {
            if self.handle != 0 {
                CloseHandle(self.handle);
            }
        }

        if self.delete_on_close {
            let wide_path = WinVfs::to_utf16(&self.path);
            unsafe {
                DeleteFileW(wide_path.as_ptr());
            }
        }
    }
}

impl WinFile {
    fn lock_region(&self, offset: u32, length: u32, exclusive: bool) -> Result<()> {
        let mut overlapped = OVERLAPPED {
            Internal: 0,
            InternalHigh: 0,
            Anonymous: OVERLAPPED_0 {
                Anonymous: OVERLAPPED_0_0 {
                    Offset: offset,
                    OffsetHigh: 0,
                },
            },
            hEvent: 0,
        };

        let flags = if exclusive {
            windows_sys::Win32::Storage::FileSystem::LOCKFILE_EXCLUSIVE_LOCK
                | windows_sys::Win32::Storage::FileSystem::LOCKFILE_FAIL_IMMEDIATELY
        } else {
            windows_sys::Win32::Storage::FileSystem::LOCKFILE_FAIL_IMMEDIATELY
        };

        let rc = unsafe { LockFileEx(self.handle, flags, 0, length, 0, &mut overlapped) };
        if rc == 0 {
            let err = unsafe { GetLastError() };
            if err == ERROR_LOCK_VIOLATION {
                return Err(Error::new(ErrorCode::Busy));
            }
            return Err(WinVfs::error_from_win32_code(err));
        }

        Ok(())
    }

    fn unlock_region(&self, offset: u32, length: u32) -> Result<()> {
        let mut overlapped = OVERLAPPED {
            Internal: 0,
            InternalHigh: 0,
            Anonymous: OVERLAPPED_0 {
                Anonymous: OVERLAPPED_0_0 {
                    Offset: offset,
                    OffsetHigh: 0,
                },
            },
            hEvent: 0,
        };

        let rc = unsafe { UnlockFileEx(self.handle, 0, length, 0, &mut overlapped) };
        if rc == 0 {
            let err = unsafe { GetLastError() };
            return Err(WinVfs::error_from_win32_code(err));
        }

        Ok(())
    }

    fn lock_shared_byte(&mut self) -> Result<()> {
        let current = self.shared_lock_byte;
        let mut start = if current == NO_SHARED_LOCK {
            (std::process::id() as u32) % SHARED_SIZE
        } else {
            (current as u32) % SHARED_SIZE
        };
        if start >= SHARED_SIZE {
            start = 0;
        }

        for i in 0..SHARED_SIZE {
            let idx = (start + i) % SHARED_SIZE;
            let offset = SHARED_FIRST + idx;
            match self.lock_region(offset, 1, false) {
                Ok(()) => {
                    self.shared_lock_byte = idx as u8;
                    return Ok(());
                }
                Err(err) if err.code == ErrorCode::Busy => continue,
                Err(err) => return Err(err),
            }
        }

        Err(Error::new(ErrorCode::Busy))
    }

    fn unlock_shared_byte(&mut self) -> Result<()> {
        let current = self.shared_lock_byte;
        if current == NO_SHARED_LOCK {
            return Ok(());
        }
        let idx = (current as u32) % SHARED_SIZE;
        if idx < SHARED_SIZE {
            self.unlock_region(SHARED_FIRST + idx, 1)?;
        }
        self.shared_lock_byte = NO_SHARED_LOCK;
        Ok(())
    }
}

impl VfsFile for WinFile {
    fn read(&mut self, buf: &mut [u8], offset: DbOffset) -> Result<ByteCount> {
        let mut overlapped = OVERLAPPED {
            Internal: 0,
            InternalHigh: 0,
            Anonymous: OVERLAPPED_0 {
                Anonymous: OVERLAPPED_0_0 {
                    Offset: (offset & 0xFFFF_FFFF) as u32,
                    OffsetHigh: ((offset >> 32) & 0xFFFF_FFFF) as u32,
                },
            },
            hEvent: 0,
        };

        let mut bytes_read: u32 = 0;
        let rc = unsafe {
            ReadFile(
                self.handle,
                buf.as_mut_ptr() as *mut _,
                buf.len() as u32,
                &mut bytes_read,
                &mut overlapped,
            )
        };

        if rc == 0 {
            let mut err = unsafe { GetLastError() };
            if err == ERROR_IO_PENDING {
                let rc2 = unsafe {
                    GetOverlappedResult(self.handle, &mut overlapped, &mut bytes_read, 1)
                };
                if rc2 == 0 {
                    err = unsafe { GetLastError() };
                } else {
                    err = 0;
                }
            }
            if err != 0 && err != ERROR_HANDLE_EOF {
                return Err(WinVfs::error_from_win32_code(err));
            }
        }

        if (bytes_read as usize) < buf.len() {
            buf[bytes_read as usize..].fill(0);
        }

        Ok(bytes_read as usize)
    }

    fn write(&mut self, buf: &[u8], offset: DbOffset) -> Result<()> {
        let mut overlapped = OVERLAPPED {
            Internal: 0,
            InternalHigh: 0,
            Anonymous: OVERLAPPED_0 {
                Anonymous: OVERLAPPED_0_0 {
                    Offset: (offset & 0xFFFF_FFFF) as u32,
                    OffsetHigh: ((offset >> 32) & 0xFFFF_FFFF) as u32,
                },
            },
            hEvent: 0,
        };

        let mut bytes_written: u32 = 0;
        let rc = unsafe {
            WriteFile(
                self.handle,
                buf.as_ptr() as *const _,
                buf.len() as u32,
                &mut bytes_written,
                &mut overlapped,
            )
        };

        if rc == 0 {
            let mut err = unsafe { GetLastError() };
            if err == ERROR_IO_PENDING {
                let rc2 = unsafe {
                    GetOverlappedResult(self.handle, &mut overlapped, &mut bytes_written, 1)
                };
                if rc2 == 0 {
                    err = unsafe { GetLastError() };
                } else {
                    err = 0;
                }
            }
            if err != 0 {
                return Err(WinVfs::error_from_win32_code(err));
            }
        }

        if (bytes_written as usize) != buf.len() {
            return Err(Error::new(ErrorCode::Full));
        }

        Ok(())
    }

    fn truncate(&mut self, size: DbOffset) -> Result<()> {
        let rc = unsafe { SetFilePointerEx(self.handle, size, std::ptr::null_mut(), FILE_BEGIN) };
        if rc == 0 {
            return Err(WinVfs::error_from_win32());
        }

        let rc = unsafe { SetEndOfFile(self.handle) };
        if rc == 0 {
            return Err(WinVfs::error_from_win32());
        }

        Ok(())
    }

    fn sync(&mut self, _flags: SyncFlags) -> Result<()> {
        let rc = unsafe { FlushFileBuffers(self.handle) };
        if rc == 0 {
            return Err(WinVfs::error_from_win32());
        }
        Ok(())
    }

    fn file_size(&self) -> Result<DbOffset> {
        let mut size: i64 = 0;
        let rc = unsafe { GetFileSizeEx(self.handle, &mut size as *mut _ as *mut _) };
        if rc == 0 {
            return Err(WinVfs::error_from_win32());
        }
        Ok(size)
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        let current = self.lock_level;

        if level <= current {
            return Ok(());
        }

        if current == LockLevel::None && level != LockLevel::Shared {
            return Err(Error::new(ErrorCode::Misuse));
        }

        if current < LockLevel::Shared && level >= LockLevel::Shared {
            self.lock_shared_byte()?;
        }

        if current < LockLevel::Reserved && level >= LockLevel::Reserved {
            self.lock_region(RESERVED_BYTE, 1, true)?;
        }

        if current < LockLevel::Pending && level >= LockLevel::Pending {
            self.lock_region(PENDING_BYTE, 1, true)?;
        }

        if level == LockLevel::Exclusive {
            self.unlock_shared_byte()?;
            self.lock_region(SHARED_FIRST, SHARED_SIZE, true)?;
        }

        self.lock_level = level;
        Ok(())
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        let current = self.lock_level;

        if level >= current {
            return Ok(());
        }

        if current == LockLevel::Exclusive && level < LockLevel::Exclusive {
            self.unlock_region(SHARED_FIRST, SHARED_SIZE)?;
            if level == LockLevel::Shared {
                self.lock_shared_byte()?;
            }
        }

        if current >= LockLevel::Pending && level < LockLevel::Pending {
            self.unlock_region(PENDING_BYTE, 1)?;
        }

        if current >= LockLevel::Reserved && level < LockLevel::Reserved {
            self.unlock_region(RESERVED_BYTE, 1)?;
        }

        if current >= LockLevel::Shared && level < LockLevel::Shared {
            self.unlock_shared_byte()?;
        }

        self.lock_level = level;
        Ok(())
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        if self.lock_level >= LockLevel::Reserved {
            return Ok(true);
        }

        match self.lock_region(RESERVED_BYTE, 1, true) {
            Ok(()) => {
                self.unlock_region(RESERVED_BYTE, 1)?;
                Ok(false)
            }
            Err(err) if err.code == ErrorCode::Busy => Ok(true),
            Err(err) => Err(err),
        }
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
    fn test_win_vfs_name() {
        let vfs = WinVfs::new();
        assert_eq!(vfs.name(), "win32");
    }
}
