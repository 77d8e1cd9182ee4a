//! vigild error types

use thiserror::Error;

/// vigild error type
#[derive(Error, Debug)]
pub enum Error {
    /// Helper executable is absent (a deployment error, not a runtime fault)
    #[error("helper executable not found")]
    PackageMissing,

    /// Helper executable failed trust validation
    #[error("helper executable failed validation: {0}")]
    Unsafe(String),

    /// Supervisor is already running
    #[error("supervisor already running")]
    AlreadyRunning,

    /// Supervisor is not running
    #[error("supervisor not running")]
    NotRunning,

    /// Caller identity does not match the registered helper
    #[error("permission denied")]
    Forbidden,

    /// Payload exceeds the fixed size bound
    #[error("payload too large")]
    TooLarge,

    /// Unrecognized or malformed argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A conflicting request is already outstanding
    #[error("busy")]
    Busy,

    /// A wait was abandoned before it completed
    #[error("interrupted")]
    Interrupted,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for vigild operations
pub type Result<T> = std::result::Result<T, Error>;
