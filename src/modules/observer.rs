//! Observation of mount lifecycle events.
//!
//! The controller reports every lifecycle step and every unmount strategy
//! transition to a [`MountObserver`]. Unmount failures are the dominant
//! operational failure of a FUSE mount, so each step is distinguishable.

use log::{debug, info, warn};
use std::fmt;
use std::io;
use std::path::Path;

/// Strategies tried, in order, when releasing a mountpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountStrategy {
    /// Plain unmount of the host path
    Direct,
    /// Closing the connection handle
    CloseHandle,
    /// Forced unmount, retried a bounded number of times
    Force,
}

impl fmt::Display for UnmountStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnmountStrategy::Direct => "direct unmount",
            UnmountStrategy::CloseHandle => "connection close",
            UnmountStrategy::Force => "forced unmount",
        };
        f.write_str(name)
    }
}

/// A step in the life of a mount.
#[derive(Debug)]
pub enum MountEvent<'a> {
    /// The OS mount call is about to be made.
    Mounting,
    /// The mount is active and serving.
    Mounted,
    /// Construction failed after the OS mount; cleanup follows.
    MountAborted {
        /// Why construction failed.
        error: &'a dyn std::error::Error,
    },
    /// The serve loop returned.
    ServeExited {
        /// What the serve loop returned.
        result: &'a io::Result<()>,
    },
    /// Teardown started.
    Unmounting,
    /// One strategy failed; the next one follows.
    StrategyFailed {
        /// The strategy that failed.
        strategy: UnmountStrategy,
        /// Its OS error.
        error: &'a io::Error,
    },
    /// A forced unmount attempt is about to be made.
    ForceAttempt {
        /// Attempt number, counted from 1.
        attempt: usize,
    },
    /// The mountpoint was released by the given strategy.
    Unmounted {
        /// The strategy that released it.
        strategy: UnmountStrategy,
    },
    /// Every strategy was exhausted.
    UnmountFailed {
        /// Forced attempts made.
        attempts: usize,
        /// Error of the last forced attempt.
        error: &'a io::Error,
    },
}

/// Receives mount lifecycle events.
pub trait MountObserver: Send + Sync + 'static {
    /// Called for every event of the mount at `mountpoint`.
    fn on_event(&self, mountpoint: &Path, event: &MountEvent<'_>);
}

/// Writes every event to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl MountObserver for LogObserver {
    fn on_event(&self, mountpoint: &Path, event: &MountEvent<'_>) {
        let mp = mountpoint.display();
        match event {
            MountEvent::Mounting => info!("Mounting {}", mp),
            MountEvent::Mounted => info!("Mounted {}", mp),
            MountEvent::MountAborted { error } => {
                warn!("Mounting {} failed, cleaning up: {}", mp, error)
            }
            MountEvent::ServeExited { result: Ok(()) } => {
                debug!("Mounting {} -- serve loop returned", mp)
            }
            MountEvent::ServeExited { result: Err(e) } => {
                debug!("Mounting {} -- serve loop returned ({})", mp, e)
            }
            MountEvent::Unmounting => info!("Unmounting {}", mp),
            MountEvent::StrategyFailed { strategy, error } => {
                debug!("Unmounting {}: {} failed: {}", mp, strategy, error)
            }
            MountEvent::ForceAttempt { attempt } => {
                debug!("Unmounting {}: forced attempt {}", mp, attempt)
            }
            MountEvent::Unmounted {
                strategy: UnmountStrategy::Force,
            } => info!("Seemingly unmounted {}", mp),
            MountEvent::Unmounted { strategy } => info!("Unmounted {} ({})", mp, strategy),
            MountEvent::UnmountFailed { attempts, error } => warn!(
                "Unmounting {} failed after {} forced attempts: {}",
                mp, attempts, error
            ),
        }
    }
}
