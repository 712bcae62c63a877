//! Error taxonomy for the mount control plane.
//!
//! Every failure path of mounting and unmounting maps to exactly one
//! [`MountError`] variant. The type is `Clone` so a lifecycle scope can hand
//! the same close result to every caller that asks for it.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Errors produced while mounting, serving or unmounting a filesystem.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MountError {
    /// A configuration value was rejected before any OS call was made.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The OS-level mount failed, or reported a deferred error after readiness.
    #[error("mounting {} failed: {source}", .path.display())]
    MountFailed {
        /// Mountpoint of the failed mount.
        path: PathBuf,
        /// OS error reported by the mount.
        #[source]
        source: Arc<io::Error>,
    },

    /// Readiness was not signalled within the startup bound.
    #[error("mounting {} timed out after {timeout:?}", .path.display())]
    MountTimeout {
        /// Mountpoint that never became ready.
        path: PathBuf,
        /// The startup bound that elapsed.
        timeout: Duration,
    },

    /// The serve loop exited before the mount became ready.
    #[error("serving {} failed: {source}", .path.display())]
    ServeFailed {
        /// Mountpoint whose serve loop exited.
        path: PathBuf,
        /// Error the serve loop returned with.
        #[source]
        source: Arc<io::Error>,
    },

    /// Direct unmount, handle close and every forced attempt failed.
    #[error("unmounting {} failed after {attempts} forced attempts: {source}", .path.display())]
    UnmountFailed {
        /// Mountpoint that could not be released.
        path: PathBuf,
        /// Forced attempts made.
        attempts: usize,
        /// Error of the last forced attempt.
        #[source]
        source: Arc<io::Error>,
    },

    /// The lifecycle scope is already closing or closed.
    #[error("scope {0} is closed")]
    Closed(String),
}

impl MountError {
    pub(crate) fn mount_failed(path: impl Into<PathBuf>, source: io::Error) -> Self {
        MountError::MountFailed {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn serve_failed(path: impl Into<PathBuf>, source: io::Error) -> Self {
        MountError::ServeFailed {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn unmount_failed(path: impl Into<PathBuf>, attempts: usize, source: io::Error) -> Self {
        MountError::UnmountFailed {
            path: path.into(),
            attempts,
            source: Arc::new(source),
        }
    }

    /// The underlying OS error, when the failure came from one.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            MountError::MountFailed { source, .. }
            | MountError::ServeFailed { source, .. }
            | MountError::UnmountFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
