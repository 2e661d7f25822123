//! Error types for ferry-core
//!
//! Every error belongs to exactly one [`ErrorClass`]. The class decides how a
//! failure is handled: transient errors are retried, resource and integrity
//! errors fail the unit immediately, operator aborts halt a deletion run and
//! invalid transitions are fatal to the whole invocation.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type alias using ferry-core's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Handling class of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network timeout, rate limit, interrupted transfer
    Transient,
    /// Local disk or remote quota exhausted
    ResourceExhausted,
    /// Checksum or size mismatch
    DataIntegrity,
    /// Operator declined a confirmation
    OperatorAborted,
    /// State machine misuse
    InvalidTransition,
    /// Configuration, permanent store and local I/O failures
    Other,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::ResourceExhausted => "resource_exhausted",
            ErrorClass::DataIntegrity => "data_integrity",
            ErrorClass::OperatorAborted => "operator_aborted",
            ErrorClass::InvalidTransition => "invalid_transition",
            ErrorClass::Other => "other",
        };
        f.write_str(name)
    }
}

/// Core error types for Ferry
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Invalid configuration value
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml_ng::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A remote call failed in a way that may succeed when repeated
    #[error("{operation} failed temporarily: {message}")]
    Transient { operation: String, message: String },

    /// A transient failure that outlived its retry budget
    #[error("{operation} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        message: String,
    },

    /// Requested object, file or unit does not exist
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// A store rejected an operation permanently
    #[error("{operation} rejected: {message}")]
    Store { operation: String, message: String },

    /// Not enough free local disk for the next stage
    #[error("Insufficient space at {path}: need {required} bytes, {available} available")]
    InsufficientSpace {
        path: String,
        required: u64,
        available: u64,
    },

    /// Remote store quota too small for the archive
    #[error("Remote quota exceeded: need {required} bytes, {available} available")]
    QuotaExceeded { required: u64, available: u64 },

    /// The local disk filled up while writing
    #[error("Disk full: {message}")]
    DiskFull { message: String },

    /// An object could not be fetched from the source store
    #[error("Download failed for {object}: {message}")]
    DownloadFailed { object: String, message: String },

    /// Archive encoding or sealing failed
    #[error("Compression failed: {message}")]
    CompressionFailed { message: String },

    /// Checksum or length mismatch
    #[error("Integrity check failed for {subject}: {message}")]
    DataIntegrity { subject: String, message: String },

    /// Operator did not supply the expected confirmation token
    #[error("Aborted by operator: {message}")]
    OperatorAborted { message: String },

    /// Attempted state change not permitted by the unit state machine
    #[error("Invalid transition for unit {unit}: {from} -> {to}")]
    InvalidTransition {
        unit: String,
        from: String,
        to: String,
    },

    /// No progress record exists for the unit
    #[error("Unknown unit: {unit}")]
    UnknownUnit { unit: String },

    /// Work was abandoned because cancellation was requested
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }

    /// Create an invalid config error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a transient error
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a permanent store error
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a download failure for one object
    pub fn download_failed(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DownloadFailed {
            object: object.into(),
            message: message.into(),
        }
    }

    /// Create a compression failure
    pub fn compression_failed(message: impl Into<String>) -> Self {
        Self::CompressionFailed {
            message: message.into(),
        }
    }

    /// Create an integrity failure
    pub fn data_integrity(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DataIntegrity {
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Create an operator abort
    pub fn operator_aborted(message: impl Into<String>) -> Self {
        Self::OperatorAborted {
            message: message.into(),
        }
    }

    /// Create an invalid transition error
    pub fn invalid_transition(
        unit: impl Into<String>,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            unit: unit.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create an unknown unit error
    pub fn unknown_unit(unit: impl Into<String>) -> Self {
        Self::UnknownUnit { unit: unit.into() }
    }

    /// Classify an I/O error raised while writing local files.
    ///
    /// Out-of-space conditions become [`Error::DiskFull`] so they are handled
    /// as resource exhaustion rather than generic I/O.
    pub fn from_write(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => Self::DiskFull {
                message: err.to_string(),
            },
            _ => Self::Io(err),
        }
    }

    /// Handling class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Transient { .. } | Error::RetriesExhausted { .. } => ErrorClass::Transient,
            Error::DownloadFailed { .. } => ErrorClass::Transient,
            Error::Io(err) if is_transient_io(err) => ErrorClass::Transient,
            Error::InsufficientSpace { .. }
            | Error::QuotaExceeded { .. }
            | Error::DiskFull { .. } => ErrorClass::ResourceExhausted,
            Error::DataIntegrity { .. } => ErrorClass::DataIntegrity,
            Error::OperatorAborted { .. } => ErrorClass::OperatorAborted,
            Error::InvalidTransition { .. } => ErrorClass::InvalidTransition,
            _ => ErrorClass::Other,
        }
    }

    /// Whether repeating the failed call may succeed.
    ///
    /// Exhausted retries and download failures are already the end of a
    /// retry loop and are not retried again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient { .. } => true,
            Error::Io(err) => is_transient_io(err),
            _ => false,
        }
    }

    /// Whether this error must abort the whole invocation
    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::InvalidTransition)
    }

    /// Operator hint for resource exhaustion
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Error::InsufficientSpace { .. } | Error::DiskFull { .. } => Some(
                "free local disk or point workspace.scratch-dir at a larger volume, then re-run migrate",
            ),
            Error::QuotaExceeded { .. } => {
                Some("free space in the remote store or raise its quota, then re-run migrate")
            }
            _ => None,
        }
    }
}

fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            Error::transient("download", "timeout").class(),
            ErrorClass::Transient
        );
        assert_eq!(
            Error::InsufficientSpace {
                path: "/tmp".into(),
                required: 10,
                available: 1
            }
            .class(),
            ErrorClass::ResourceExhausted
        );
        assert_eq!(
            Error::data_integrity("archive", "checksum").class(),
            ErrorClass::DataIntegrity
        );
        assert_eq!(
            Error::operator_aborted("no").class(),
            ErrorClass::OperatorAborted
        );
        assert_eq!(
            Error::invalid_transition("u", "PENDING", "COMPLETED").class(),
            ErrorClass::InvalidTransition
        );
        assert_eq!(Error::store("delete", "denied").class(), ErrorClass::Other);
    }

    #[test]
    fn test_transient_io() {
        let err = Error::Io(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(err.is_transient());

        let err = Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_exhausted_is_not_retried_again() {
        let err = Error::RetriesExhausted {
            operation: "upload".into(),
            attempts: 3,
            message: "timeout".into(),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_from_write_maps_storage_full() {
        let err = Error::from_write(io::Error::new(io::ErrorKind::StorageFull, "no space"));
        assert!(matches!(err, Error::DiskFull { .. }));
        assert!(err.remediation().is_some());
    }

    #[test]
    fn test_fatal_only_for_invalid_transition() {
        assert!(Error::invalid_transition("u", "A", "B").is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }

    #[test]
    fn test_display() {
        let err = Error::download_failed("logs/a.txt", "reset by peer");
        assert_eq!(
            err.to_string(),
            "Download failed for logs/a.txt: reset by peer"
        );
    }
}
