//! Process-wide configuration shared by the mutex subsystem and store defaults.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{OnceLock, RwLock};

use crate::error::{Error, ErrorCode, Result};
use crate::os::mutex;

/// Controls whether the mutex layer hands out real locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingMode {
    /// No internal mutexes are taken; caller must serialize access itself.
    SingleThread = 1,
    /// Default: a database connection may be used by multiple threads,
    /// but not concurrently.
    MultiThread = 2,
    /// Fully thread-safe: any handle may be used by any thread at any time.
    Serialized = 3,
}

pub struct GlobalConfig {
    pub is_init: AtomicBool,
    pub threading_mode: RwLock<ThreadingMode>,
    pub page_cache_size: AtomicI64,
    pub page_size: AtomicI64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            is_init: AtomicBool::new(false),
            threading_mode: RwLock::new(ThreadingMode::Serialized),
            page_cache_size: AtomicI64::new(-2000),
            page_size: AtomicI64::new(4096),
        }
    }
}

static GLOBAL_CONFIG: OnceLock<GlobalConfig> = OnceLock::new();

/// Access the process-wide configuration singleton.
pub fn global_config() -> &'static GlobalConfig {
    GLOBAL_CONFIG.get_or_init(GlobalConfig::default)
}

/// Bring up process-wide state (mutex subsystem). Idempotent.
pub fn library_init() -> Result<()> {
    let code = mutex::mutex_init();
    if code != ErrorCode::Ok {
        return Err(Error::new(code));
    }
    global_config().is_init.store(true, Ordering::SeqCst);
    Ok(())
}

/// Tear down process-wide state. Idempotent.
pub fn library_shutdown() -> Result<()> {
    global_config().is_init.store(false, Ordering::SeqCst);
    let code = mutex::mutex_end();
    if code != ErrorCode::Ok {
        return Err(Error::new(code));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_init_is_idempotent() {
        library_init().unwrap();
        library_init().unwrap();
        library_shutdown().unwrap();
    }

    #[test]
    fn default_threading_mode_is_serialized() {
        assert_eq!(*global_config().threading_mode.read().unwrap(), ThreadingMode::Serialized);
    }
}
