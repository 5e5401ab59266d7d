//! Error types shared by every locker component.

use std::path::PathBuf;

/// Result type alias for locker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while reconciling a project against the host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Fatal: abort the whole invocation
    // =========================================================================
    /// Malformed or missing project declaration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Not running with the privileges needed to touch netfilter and links.
    #[error("insufficient privileges: {0}")]
    Privilege(String),

    /// The container runtime tools cannot be reached.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Shared netfilter chains could not be manipulated.
    #[error("netfilter error: {0}")]
    Netfilter(String),

    // =========================================================================
    // Project-scoped
    // =========================================================================
    /// No free /24 left in the private range.
    #[error("no unused /24 network available in 10.0.0.0/8")]
    SubnetExhausted,

    /// Bridge device could not be created, addressed or removed.
    #[error("bridge '{bridge}': {reason}")]
    Bridge { bridge: String, reason: String },

    // =========================================================================
    // Instance-scoped: logged, the batch continues
    // =========================================================================
    /// Instance could not be created.
    #[error("failed to create '{name}': {reason}")]
    Create { name: String, reason: String },

    /// Instance must be stopped before the operation.
    #[error("instance '{0}' is still running")]
    StillRunning(String),

    /// Instance did not report an address before the deadline.
    #[error("instance '{name}' has no address after {seconds}s")]
    NoAddress { name: String, seconds: u64 },

    /// A single runtime call on an instance failed.
    #[error("runtime call '{op}' failed for '{name}': {reason}")]
    Runtime {
        op: &'static str,
        name: String,
        reason: String,
    },

    /// Unexpected or malformed rule state; the rule is skipped.
    #[error("rule conflict: {0}")]
    RuleConflict(String),

    /// File access inside an instance root or configuration directory.
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Returns `true` for errors that must terminate the invocation instead
    /// of being recorded against a single instance.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Privilege(_)
                | Self::RuntimeUnavailable(_)
                | Self::Netfilter(_)
                | Self::SubnetExhausted
                | Self::Bridge { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
