//! Error types and Result alias shared across the storage engine.

use std::fmt;

/// Result code, matching the taxonomy the storage layer reasons about
/// (see [`crate::util::general::error_str`] for the matching human text).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    Error = 1,
    Internal = 2,
    Perm = 3,
    Abort = 4,
    Busy = 5,
    Locked = 6,
    NoMem = 7,
    ReadOnly = 8,
    Interrupt = 9,
    IoErr = 10,
    Corrupt = 11,
    NotFound = 12,
    Full = 13,
    CantOpen = 14,
    Protocol = 15,
    Empty = 16,
    Schema = 17,
    TooBig = 18,
    Constraint = 19,
    Mismatch = 20,
    Misuse = 21,
    NoLfs = 22,
    Auth = 23,
    Format = 24,
    Range = 25,
    NotADb = 26,
    Notice = 27,
    Warning = 28,
    Row = 29,
    Done = 30,
}

impl ErrorCode {
    /// Convert a raw status code back to `ErrorCode`, defaulting to `Error`
    /// for values we don't recognize.
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => ErrorCode::Ok,
            1 => ErrorCode::Error,
            2 => ErrorCode::Internal,
            3 => ErrorCode::Perm,
            4 => ErrorCode::Abort,
            5 => ErrorCode::Busy,
            6 => ErrorCode::Locked,
            7 => ErrorCode::NoMem,
            8 => ErrorCode::ReadOnly,
            9 => ErrorCode::Interrupt,
            10 => ErrorCode::IoErr,
            11 => ErrorCode::Corrupt,
            12 => ErrorCode::NotFound,
            13 => ErrorCode::Full,
            14 => ErrorCode::CantOpen,
            15 => ErrorCode::Protocol,
            16 => ErrorCode::Empty,
            17 => ErrorCode::Schema,
            18 => ErrorCode::TooBig,
            19 => ErrorCode::Constraint,
            20 => ErrorCode::Mismatch,
            21 => ErrorCode::Misuse,
            22 => ErrorCode::NoLfs,
            23 => ErrorCode::Auth,
            24 => ErrorCode::Format,
            25 => ErrorCode::Range,
            26 => ErrorCode::NotADb,
            27 => ErrorCode::Notice,
            28 => ErrorCode::Warning,
            29 => ErrorCode::Row,
            30 => ErrorCode::Done,
            _ => ErrorCode::Error,
        }
    }

    /// `NotFound` is reported as an error code but isn't one: callers treat
    /// it as a normal "no such entry" outcome rather than a failure to log.
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            ErrorCode::Ok | ErrorCode::Row | ErrorCode::Done | ErrorCode::NotFound
        )
    }
}

/// An error together with optional human-readable context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub code: ErrorCode,
    pub message: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}", msg),
            None => write!(f, "{}", crate::util::general::error_str(self.code)),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::CantOpen,
            std::io::ErrorKind::PermissionDenied => ErrorCode::Perm,
            std::io::ErrorKind::AlreadyExists => ErrorCode::CantOpen,
            std::io::ErrorKind::WouldBlock => ErrorCode::Busy,
            std::io::ErrorKind::Interrupted => ErrorCode::Interrupt,
            std::io::ErrorKind::OutOfMemory => ErrorCode::NoMem,
            _ => ErrorCode::IoErr,
        };
        Error::with_message(code, err.to_string())
    }
}

/// Result type alias for storage-engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_i32_roundtrips_known_codes() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::Busy,
            ErrorCode::Corrupt,
            ErrorCode::NotFound,
            ErrorCode::Done,
        ] {
            assert_eq!(ErrorCode::from_i32(code as i32), code);
        }
    }

    #[test]
    fn from_i32_defaults_unknown_to_error() {
        assert_eq!(ErrorCode::from_i32(9999), ErrorCode::Error);
    }

    #[test]
    fn not_found_is_not_an_error() {
        assert!(!ErrorCode::NotFound.is_error());
        assert!(ErrorCode::Corrupt.is_error());
    }

    #[test]
    fn display_falls_back_to_error_str_without_message() {
        let err = Error::new(ErrorCode::Busy);
        assert_eq!(err.to_string(), "database is locked");
    }

    #[test]
    fn display_prefers_explicit_message() {
        let err = Error::with_message(ErrorCode::IoErr, "disk fell over");
        assert_eq!(err.to_string(), "disk fell over");
    }
}
