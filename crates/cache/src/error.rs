//! Error types for the build cache

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for build cache operations
///
/// Everything in here is fatal for the operation that produced it. Remote
/// tier problems are reported through [`RemoteError`] and never escape a
/// batch as an `Error`.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(buildcache::io),
        help("Check file permissions and available disk space")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "create")
        operation: String,
    },

    /// Configuration or validation error
    #[error("Build cache configuration error: {message}")]
    #[diagnostic(code(buildcache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(buildcache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// A cache key could not be parsed
    #[error("Invalid cache key: {message}")]
    #[diagnostic(
        code(buildcache::invalid_key),
        help("Cache keys are 64 hex characters (SHA-256)")
    )]
    InvalidKey {
        /// What was wrong with the key
        message: String,
    },

    /// A local entry exists but cannot be read back intact
    #[error("Local build cache entry {key} is corrupted: {message}")]
    #[diagnostic(
        code(buildcache::local_corruption),
        help("Delete the local cache directory or the offending entry and rebuild")
    )]
    LocalCorruption {
        /// Key of the corrupted entry
        key: String,
        /// Details of the corruption
        message: String,
    },

    /// A codec failed to encode or decode an entry
    #[error("{codec} codec failed: {message}")]
    #[diagnostic(code(buildcache::codec))]
    Codec {
        /// Name of the codec
        codec: &'static str,
        /// Error message from the codec
        message: String,
    },

    /// Restored content does not hash to the digest recorded for it
    #[error("Build cache entry {key} does not match its recorded content: {message}")]
    #[diagnostic(code(buildcache::content_mismatch))]
    ContentMismatch {
        /// Content hash the manifest recorded
        key: String,
        /// What differed
        message: String,
    },

    /// An output tree does not match its declared shape
    #[error("Invalid output: {message}")]
    #[diagnostic(code(buildcache::invalid_output))]
    InvalidOutput {
        /// Error message describing the mismatch
        message: String,
    },

    /// Remote transfers were still running when the close budget ran out
    #[error("Timed out after {timeout_secs}s waiting for {pending} build cache transfer(s) to finish")]
    #[diagnostic(
        code(buildcache::shutdown_timeout),
        help("The remote cache may be unreachable; pending uploads were abandoned")
    )]
    ShutdownTimeout {
        /// Transfers still outstanding when the budget expired
        pending: usize,
        /// The close budget in seconds
        timeout_secs: u64,
    },

    /// A lease was released more than once
    #[error("Build cache lease #{lease} was already released")]
    #[diagnostic(
        code(buildcache::lease_released),
        help("Each lease must be closed exactly once")
    )]
    LeaseReleased {
        /// Identifier of the lease
        lease: u64,
    },

    /// The cache has already been closed
    #[error("Build cache has already been closed")]
    #[diagnostic(code(buildcache::closed))]
    Closed,
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an invalid key error
    #[must_use]
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: msg.into(),
        }
    }

    /// Create a local corruption error
    #[must_use]
    pub fn local_corruption(key: impl ToString, msg: impl Into<String>) -> Self {
        Self::LocalCorruption {
            key: key.to_string(),
            message: msg.into(),
        }
    }

    /// Create a codec error
    #[must_use]
    pub fn codec(codec: &'static str, msg: impl Into<String>) -> Self {
        Self::Codec {
            codec,
            message: msg.into(),
        }
    }

    /// Create a content mismatch error
    #[must_use]
    pub fn content_mismatch(key: impl ToString, msg: impl Into<String>) -> Self {
        Self::ContentMismatch {
            key: key.to_string(),
            message: msg.into(),
        }
    }

    /// Create an invalid output error
    #[must_use]
    pub fn invalid_output(msg: impl Into<String>) -> Self {
        Self::InvalidOutput {
            message: msg.into(),
        }
    }
}

/// Result type for build cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure talking to the remote tier
///
/// These are soft: the coordinator records them through the handler hooks
/// and treats the entry as a miss.
#[derive(Error, Debug, Diagnostic)]
pub enum RemoteError {
    /// Could not reach the backend
    #[error("Failed to connect to remote cache {endpoint}: {message}")]
    #[diagnostic(code(buildcache::remote::connection))]
    Connection {
        /// Backend endpoint
        endpoint: String,
        /// Error message
        message: String,
    },

    /// The operation exceeded its deadline
    #[error("Remote cache {operation} timed out after {timeout_secs}s")]
    #[diagnostic(code(buildcache::remote::timeout))]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Deadline in seconds
        timeout_secs: u64,
    },

    /// The backend answered with an unexpected status
    #[error("Remote cache returned status {status} for {operation}")]
    #[diagnostic(code(buildcache::remote::status))]
    Status {
        /// Operation that failed
        operation: String,
        /// Status code returned by the backend
        status: u16,
    },

    /// The backend answered with something that cannot be interpreted
    #[error("Malformed response from remote cache: {message}")]
    #[diagnostic(code(buildcache::remote::protocol))]
    Protocol {
        /// Error message
        message: String,
    },

    /// Local I/O performed on behalf of a remote backend failed
    #[error("Remote cache I/O {operation} failed: {source}")]
    #[diagnostic(code(buildcache::remote::io))]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Operation that failed
        operation: String,
    },

    /// The transfer was abandoned because the cache is shutting down
    #[error("Remote transfer cancelled")]
    #[diagnostic(code(buildcache::remote::cancelled))]
    Cancelled,

    /// All retry attempts failed
    #[error("Remote cache {operation} failed after {attempts} attempts: {last_error}")]
    #[diagnostic(code(buildcache::remote::retry_exhausted))]
    RetryExhausted {
        /// Operation being retried
        operation: String,
        /// Number of attempts made
        attempts: usize,
        /// Message of the last failure
        last_error: String,
    },
}

impl RemoteError {
    /// Create a connection error
    #[must_use]
    pub fn connection(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(operation: impl Into<String>, timeout_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_secs,
        }
    }

    /// Create a status error
    #[must_use]
    pub fn status(operation: impl Into<String>, status: u16) -> Self {
        Self::Status {
            operation: operation.into(),
            status,
        }
    }

    /// Create a protocol error
    #[must_use]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
        }
    }

    /// Create an I/O error
    #[must_use]
    pub fn io(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            operation: operation.into(),
        }
    }

    /// Create a retry exhausted error
    #[must_use]
    pub fn retry_exhausted(
        operation: impl Into<String>,
        attempts: usize,
        last_error: impl Into<String>,
    ) -> Self {
        Self::RetryExhausted {
            operation: operation.into(),
            attempts,
            last_error: last_error.into(),
        }
    }

    /// Whether repeating the operation could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } | Self::Io { .. } => true,
            // Server-side and throttling failures
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Protocol { .. } | Self::Cancelled | Self::RetryExhausted { .. } => false,
        }
    }
}

/// Result type for remote tier operations
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mentions_path() {
        let err = Error::io(
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            "/cache/ab/abcd",
            "write",
        );
        let message = err.to_string();
        assert!(message.contains("write"));
        assert!(message.contains("/cache/ab/abcd"));
    }

    #[test]
    fn local_corruption_names_key_and_tier() {
        let err = Error::local_corruption("abc123", "digest mismatch");
        let message = err.to_string();
        assert!(message.contains("abc123"));
        assert!(message.contains("Local build cache"));
    }

    #[test]
    fn retryable_classification() {
        assert!(RemoteError::timeout("load", 30).is_retryable());
        assert!(RemoteError::connection("http://cache", "refused").is_retryable());
        assert!(RemoteError::status("load", 503).is_retryable());
        assert!(RemoteError::status("load", 429).is_retryable());
        assert!(!RemoteError::status("store", 403).is_retryable());
        assert!(!RemoteError::protocol("garbage").is_retryable());
        assert!(!RemoteError::Cancelled.is_retryable());
    }
}
