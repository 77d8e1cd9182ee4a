//! Control socket wire protocol
//!
//! Newline-delimited JSON over the Unix control socket. Each request
//! line produces exactly one response line.

use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Inbound control request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Current helper pid (0 when none).
    Pid,
    /// Daemon start timestamps.
    InsertTime,
    /// Current console lock flag.
    GetLock,
    /// Engage or release the console lock (privileged callers).
    SetLock { locked: bool },
    /// Operator alert (helper only).
    Alert { message: String },
    /// Power action (helper only).
    Power { action: String },
}

/// Outbound control response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Pid { pid: i32 },
    InsertTime { wall_ns: i64, boot_ns: i64 },
    Lock { locked: bool },
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn error(err: &Error) -> Self {
        Response::Error {
            kind: ErrorKind::from(err),
            message: err.to_string(),
        }
    }
}

/// Compact error kinds surfaced on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PackageMissing,
    Unsafe,
    AlreadyRunning,
    NotRunning,
    Forbidden,
    TooLarge,
    InvalidArgument,
    Busy,
    Interrupted,
    Config,
    Io,
    Internal,
}

impl From<&Error> for ErrorKind {
    fn from(err: &Error) -> Self {
        match err {
            Error::PackageMissing => Self::PackageMissing,
            Error::Unsafe(_) => Self::Unsafe,
            Error::AlreadyRunning => Self::AlreadyRunning,
            Error::NotRunning => Self::NotRunning,
            Error::Forbidden => Self::Forbidden,
            Error::TooLarge => Self::TooLarge,
            Error::InvalidArgument(_) => Self::InvalidArgument,
            Error::Busy => Self::Busy,
            Error::Interrupted => Self::Interrupted,
            Error::Config(_) => Self::Config,
            Error::Io(_) => Self::Io,
            Error::Internal(_) => Self::Internal,
        }
    }
}
