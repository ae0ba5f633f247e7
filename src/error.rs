//! Error taxonomy for the gateway core.
//!
//! Every public operation returns [`GatewayResult`]. Callers branch on the
//! variant, not on the wrapped source error.

use std::io;
use std::path::PathBuf;

/// Crate-wide result alias.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error kinds surfaced by the gateway core.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Target path or xattr does not exist, or a lock has expired.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation is disabled in this build or documented as unsupported.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Malformed request: lock holder/id mismatch, missing lock on refresh.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Advisory lock could not be acquired.
    #[error("locked: {0}")]
    Locked(String),

    /// A path escape attempt was detected. Never recovered; always fatal to
    /// the request that triggered it.
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// Malformed fstab entry, missing required option, or incompatible
    /// filesystem type.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// No active MDS could be found, or an administrative RPC failed.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A caller-side cancellation token fired before the dispatched job's
    /// response arrived. The job itself still runs to completion on its
    /// worker; this only short-circuits the caller's wait.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Unexpected OS or serialization error, wrapped with context.
    #[error("internal error ({context}): {source}")]
    Internal {
        /// What the gateway was doing when the error occurred.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl GatewayError {
    /// Wrap an arbitrary error as [`GatewayError::Internal`] with context
    /// describing the operation and path involved.
    pub fn internal(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        GatewayError::Internal {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Wrap a path-scoped I/O error with enough context to identify the
    /// operation and the path involved.
    pub fn io_context(op: &str, path: &PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => GatewayError::NotFound(format!("{op} {}", path.display())),
            _ => GatewayError::internal(format!("{op} {}", path.display()), source),
        }
    }

    /// True if this error must never be silently absorbed by a caller.
    pub fn is_fatal_violation(&self) -> bool {
        matches!(self, GatewayError::SecurityViolation(_))
    }
}

impl From<io::Error> for GatewayError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => GatewayError::NotFound(e.to_string()),
            _ => GatewayError::internal("io", e),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::internal("json decode", e)
    }
}

impl From<nix::Error> for GatewayError {
    fn from(e: nix::Error) -> Self {
        match e {
            nix::Error::ENOENT => GatewayError::NotFound(e.to_string()),
            other => GatewayError::internal("syscall", io::Error::from(other)),
        }
    }
}
