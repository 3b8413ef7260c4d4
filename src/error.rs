use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// emberdb errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// Generic DFS or local I/O failure.
    Io(String),
    /// Non-retriable storage failure; the owning engine must force-unload.
    PermissionDenied(String),
    /// Invalid on-disk data: decoding errors, checksum mismatches, truncated
    /// or missing files.
    Corruption(String),
    /// Invalid caller input: malformed requests, bad flag values, overlapping
    /// key ranges.
    InvalidArgument(String),
    /// A write was attempted on a sealed structure (a memtable being flushed,
    /// a finished table builder).
    ReadOnly,
    /// The client deadline elapsed before the work completed.
    Timeout,
    /// A stored background error; writes against the engine fail fast until
    /// it is unloaded.
    Background(String),
    /// The operation was aborted by shutdown or unload.
    Aborted,
    /// The key lies outside the target tablet's range, or the tablet is not
    /// on this server.
    NotInRange,
    /// The tablet's read quota or inflight guard rejected the request.
    Busy,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::Timeout => write!(f, "deadline elapsed"),
            Error::Background(msg) => write!(f, "background error: {msg}"),
            Error::Aborted => write!(f, "operation aborted"),
            Error::NotInRange => write!(f, "key not in tablet range"),
            Error::Busy => write!(f, "tablet is busy"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// Constructs an Error::InvalidArgument for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)) };
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Error::PermissionDenied(err.to_string())
        } else {
            Error::Io(err.to_string())
        }
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corruption(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}

/// Client-visible status carried in control and data responses. Per-row
/// failures in a batch are reported through a parallel vector of these while
/// the call itself still succeeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    /// Target tablet not on this server or key outside its range.
    KeyNotInRange,
    /// Session-id mismatch, or the schema was invalid at load.
    IllegalAccess,
    /// Generic DFS or local I/O failure.
    IoError,
    /// Non-retriable storage failure; triggers force-unload.
    IoPermissionDenied,
    /// Split requested on an engine that cannot produce a split key.
    TableNotSupport,
    /// Client deadline elapsed before the work completed.
    RpcTimeout,
    /// Read quota or inflight guard rejected the request.
    NodeBusy,
    /// Row absent or fully shadowed by tombstones and strategy drops.
    KeyNotExist,
    /// Malformed update or control request.
    InvalidArgument,
}

impl From<&Error> for StatusCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::Io(_) | Error::Background(_) | Error::Aborted => StatusCode::IoError,
            Error::PermissionDenied(_) => StatusCode::IoPermissionDenied,
            Error::Corruption(_) => StatusCode::IoError,
            Error::InvalidArgument(_) | Error::ReadOnly => StatusCode::InvalidArgument,
            Error::Timeout => StatusCode::RpcTimeout,
            Error::NotInRange => StatusCode::KeyNotInRange,
            Error::Busy => StatusCode::NodeBusy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ssd gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::PermissionDenied(_)));
        assert_eq!(StatusCode::from(&err), StatusCode::IoPermissionDenied);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(StatusCode::from(&Error::Timeout), StatusCode::RpcTimeout);
        assert_eq!(
            StatusCode::from(&errinput!("bad flag {}", "x")),
            StatusCode::InvalidArgument
        );
        assert_eq!(StatusCode::from(&errcorrupt!("bad magic")), StatusCode::IoError);
    }
}
