//! Error types for the scan engine.
//!
//! `ScanError` is the single error type returned by every engine operation.
//! It is built with `thiserror` and groups failures into the classes the
//! engine reacts to differently:
//!
//! - **`NullArgument` / `CorruptState`**: an internal invariant was violated.
//!   These are bugs and always abort the scan.
//! - **`NotFound` / `TypeMismatch`**: a configuration referenced a record that
//!   does not exist, or one of the wrong device class.
//! - **`UnparseableArguments`**: a description or argument string could not be
//!   parsed.
//! - **`PauseRequested`**: transient. The pause/abort retry wrapper absorbs it
//!   and callers above that layer never see it.
//! - **`StopRequested` / `Interrupted`**: the user asked the scan to stop
//!   or abort.
//! - **`DeviceIo`**: a hardware collaborator reported a failure. Capability
//!   traits return `anyhow::Result`, so any `anyhow::Error` converts into this
//!   variant through `?`.
//! - **`WouldExceedLimit`**: a value did not fit the field it was rendered into.
//!
//! Every variant carries a stable numeric code, reported in the
//! "terminated with error code N" message.

use thiserror::Error;

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Null argument: {0}")]
    NullArgument(String),

    #[error("Corrupt internal state: {0}")]
    CorruptState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Unparseable arguments: {0}")]
    UnparseableArguments(String),

    #[error("Scan interrupted by user")]
    Interrupted,

    #[error("Pause requested")]
    PauseRequested,

    #[error("Stop requested")]
    StopRequested,

    #[error("Device I/O error: {0}")]
    DeviceIo(String),

    #[error("Would exceed limit: {0}")]
    WouldExceedLimit(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Scan description error: {0}")]
    Description(Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl ScanError {
    /// Stable numeric code for this error class.
    pub fn code(&self) -> u32 {
        match self {
            ScanError::NullArgument(_) => 1,
            ScanError::CorruptState(_) => 2,
            ScanError::NotFound(_) => 3,
            ScanError::TypeMismatch(_) => 4,
            ScanError::UnparseableArguments(_) => 5,
            ScanError::Interrupted => 6,
            ScanError::PauseRequested => 7,
            ScanError::StopRequested => 8,
            ScanError::DeviceIo(_) => 9,
            ScanError::WouldExceedLimit(_) => 10,
            ScanError::Io(_) => 11,
            ScanError::Config(_) | ScanError::Description(_) | ScanError::Configuration(_) => 12,
        }
    }

    /// True for the user-driven interruption classes (pause, stop, abort).
    pub fn is_user_request(&self) -> bool {
        matches!(
            self,
            ScanError::PauseRequested | ScanError::StopRequested | ScanError::Interrupted
        )
    }
}

impl From<anyhow::Error> for ScanError {
    fn from(err: anyhow::Error) -> Self {
        ScanError::DeviceIo(format!("{err:#}"))
    }
}

impl From<figment::Error> for ScanError {
    fn from(err: figment::Error) -> Self {
        ScanError::Description(Box::new(err))
    }
}
