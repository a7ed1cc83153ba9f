//! Error types for streamfs.
//!
//! Three families, matching how callers are expected to react:
//!
//! - [`StreamError`]: returned by stream, table, filesystem and handle
//!   operations. Everything except [`StreamError::Timeout`] is terminal.
//! - [`OutputError`]: failures of the external output store. These only
//!   degrade durability; the live path logs them and carries on.
//! - [`ConfigError`]: rejected mount options, raised before any stream exists.

use std::io::{Error as IoError, ErrorKind};
use std::time::Duration;

use thiserror::Error;

/// Result alias used across the crate.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors from stream and filesystem operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream is closed: {name}")]
    Closed { name: String },

    #[error("stream not found: {path}")]
    NotFound { path: String },

    #[error("stream already exists: {path}")]
    AlreadyExists { path: String },

    #[error("{path} is read-only: reserved for documentation")]
    ReadOnly { path: String },

    #[error("invalid stream path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("streams are append-only: write at offset {offset} rejected (append position is {append_at})")]
    NonAppendWrite { offset: u64, append_at: u64 },

    #[error("use stream mode for reading stream files: {path}")]
    StreamModeRequired { path: String },

    #[error("read timed out after {}ms", duration.as_millis())]
    Timeout { duration: Duration },

    #[error("offset {offset} has been trimmed from the handle window (oldest retained offset is {base})")]
    OffsetTrimmed { offset: u64, base: u64 },

    #[error("seek to {target} is outside the buffered window [{base}, {end}]")]
    InvalidSeek { target: i128, base: u64, end: u64 },

    #[error("handle not found: {id}")]
    HandleNotFound { id: u64 },

    #[error("handle {id} is not attached to a writable stream")]
    NotWritable { id: u64 },
}

impl StreamError {
    /// Soft errors that callers should retry rather than surface.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::Timeout { .. })
    }

    /// Whether this error means the stream has ended for the caller.
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamError::Closed { .. })
    }
}

impl From<StreamError> for IoError {
    fn from(e: StreamError) -> Self {
        let kind = match &e {
            StreamError::Closed { .. } => ErrorKind::BrokenPipe,
            StreamError::NotFound { .. } | StreamError::HandleNotFound { .. } => ErrorKind::NotFound,
            StreamError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            StreamError::ReadOnly { .. } | StreamError::NotWritable { .. } => ErrorKind::PermissionDenied,
            StreamError::Timeout { .. } => ErrorKind::TimedOut,
            _ => ErrorKind::InvalidInput,
        };
        IoError::new(kind, e)
    }
}

/// Errors from the output store used for rotated files.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output I/O error: {0}")]
    Io(IoError),

    #[error("output path not found: {0}")]
    NotFound(String),

    #[error("output path already exists: {0}")]
    AlreadyExists(String),

    #[error("output store does not support {0}")]
    Unsupported(&'static str),

    #[error("output writer is closed: {0}")]
    WriterClosed(String),

    #[error("output store error: {0}")]
    Other(String),
}

impl From<IoError> for OutputError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::NotFound => OutputError::NotFound(e.to_string()),
            ErrorKind::AlreadyExists => OutputError::AlreadyExists(e.to_string()),
            _ => OutputError::Io(e),
        }
    }
}

/// Errors raised while validating mount options.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}: invalid size format '{value}' (expected format: 512KB, 1MB, etc)")]
    InvalidSize { key: &'static str, value: String },

    #[error("invalid {key}: '{value}': {reason}")]
    InvalidDuration {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("output_path is required when rotation_interval or rotation_size is set")]
    MissingOutputPath,

    #[error("output_path must be an absolute path (must start with /), e.g. /s3fs/bucket or /localfs/data, got '{0}'")]
    InvalidOutputPath(String),

    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] IoError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_retryable() {
        let err = StreamError::Timeout {
            duration: Duration::from_millis(250),
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "read timed out after 250ms");

        let closed = StreamError::Closed {
            name: "/live".to_string(),
        };
        assert!(!closed.is_retryable());
        assert!(closed.is_closed());
    }

    #[test]
    fn test_output_error_from_io() {
        let err: OutputError = IoError::new(ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, OutputError::NotFound(_)));

        let err: OutputError = IoError::new(ErrorKind::Other, "disk").into();
        assert!(matches!(err, OutputError::Io(_)));
    }

    #[test]
    fn test_stream_error_into_io() {
        let io: IoError = StreamError::Closed {
            name: "/x".to_string(),
        }
        .into();
        assert_eq!(io.kind(), ErrorKind::BrokenPipe);
    }
}
