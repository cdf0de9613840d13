//! Error types shared across the crate.
//!
//! Every fallible operation returns `Result<T, E2sarError>`. Each variant
//! carries a human-readable message; `ErrorKind` is the message-free
//! discriminant that fits into an atomic stats slot.

use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

pub type Result<T> = std::result::Result<T, E2sarError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum E2sarError {
    #[error("caught exception: {0}")]
    CaughtException(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("parameter error: {0}")]
    Parameter(String),
    #[error("parameter not available: {0}")]
    ParameterNotAvailable(String),
    #[error("out of range: {0}")]
    OutOfRange(String),
    #[error("undefined: {0}")]
    Undefined(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("memory error: {0}")]
    Memory(String),
    #[error("logic error: {0}")]
    Logic(String),
    #[error("system error: {0}")]
    System(String),
}

/// Message-free discriminant of [`E2sarError`], storable in an atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorKind {
    NoError = 0,
    CaughtException = 1,
    Parse = 2,
    Parameter = 3,
    ParameterNotAvailable = 4,
    OutOfRange = 5,
    Undefined = 6,
    NotFound = 7,
    Rpc = 8,
    Socket = 9,
    Memory = 10,
    Logic = 11,
    System = 12,
}

impl ErrorKind {
    pub fn from_u32(v: u32) -> ErrorKind {
        match v {
            1 => ErrorKind::CaughtException,
            2 => ErrorKind::Parse,
            3 => ErrorKind::Parameter,
            4 => ErrorKind::ParameterNotAvailable,
            5 => ErrorKind::OutOfRange,
            6 => ErrorKind::Undefined,
            7 => ErrorKind::NotFound,
            8 => ErrorKind::Rpc,
            9 => ErrorKind::Socket,
            10 => ErrorKind::Memory,
            11 => ErrorKind::Logic,
            12 => ErrorKind::System,
            _ => ErrorKind::NoError,
        }
    }
}

impl E2sarError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            E2sarError::CaughtException(_) => ErrorKind::CaughtException,
            E2sarError::Parse(_) => ErrorKind::Parse,
            E2sarError::Parameter(_) => ErrorKind::Parameter,
            E2sarError::ParameterNotAvailable(_) => ErrorKind::ParameterNotAvailable,
            E2sarError::OutOfRange(_) => ErrorKind::OutOfRange,
            E2sarError::Undefined(_) => ErrorKind::Undefined,
            E2sarError::NotFound(_) => ErrorKind::NotFound,
            E2sarError::Rpc(_) => ErrorKind::Rpc,
            E2sarError::Socket(_) => ErrorKind::Socket,
            E2sarError::Memory(_) => ErrorKind::Memory,
            E2sarError::Logic(_) => ErrorKind::Logic,
            E2sarError::System(_) => ErrorKind::System,
        }
    }

    /// Wrap the current `errno` value into a socket error.
    pub fn last_os_socket_error(context: &str) -> E2sarError {
        let e = std::io::Error::last_os_error();
        E2sarError::Socket(format!("{}: {}", context, e))
    }
}

/// Atomic holder for the last observed [`ErrorKind`].
#[derive(Debug, Default)]
pub struct AtomicErrorKind(AtomicU32);

impl AtomicErrorKind {
    pub fn store(&self, kind: ErrorKind) {
        self.0.store(kind as u32, Relaxed);
    }

    pub fn load(&self) -> ErrorKind {
        ErrorKind::from_u32(self.0.load(Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for k in [
            ErrorKind::NoError,
            ErrorKind::CaughtException,
            ErrorKind::Parse,
            ErrorKind::Parameter,
            ErrorKind::ParameterNotAvailable,
            ErrorKind::OutOfRange,
            ErrorKind::Undefined,
            ErrorKind::NotFound,
            ErrorKind::Rpc,
            ErrorKind::Socket,
            ErrorKind::Memory,
            ErrorKind::Logic,
            ErrorKind::System,
        ] {
            assert_eq!(ErrorKind::from_u32(k as u32), k);
        }
    }

    #[test]
    fn test_atomic_error_kind() {
        let a = AtomicErrorKind::default();
        assert_eq!(a.load(), ErrorKind::NoError);
        a.store(ErrorKind::Socket);
        assert_eq!(a.load(), ErrorKind::Socket);
    }

    #[test]
    fn test_error_messages_carry_context() {
        let e = E2sarError::Rpc("deadline exceeded".into());
        assert_eq!(e.kind(), ErrorKind::Rpc);
        assert!(e.to_string().contains("deadline exceeded"));
    }
}
