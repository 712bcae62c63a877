//! Timing bounds of the mount lifecycle and constants of the snapshot filesystem.

use std::time::Duration;

// Mount lifecycle timing

/// How long a mount may take to become ready before it is torn down.
pub const MOUNT_TIMEOUT: Duration = Duration::from_secs(5);
/// Forced unmount attempts before giving up on a mountpoint.
pub const FORCE_UNMOUNT_ATTEMPTS: usize = 10;
/// Pause between two forced unmount attempts.
pub const FORCE_UNMOUNT_DELAY: Duration = Duration::from_millis(500);
/// Polling pace while waiting for the kernel to attach the mount.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

// File system constants

/// Attribute and entry cache lifetime handed to the kernel.
pub const TTL: Duration = Duration::from_secs(1);
/// Block size reported for every file.
pub const BLOCK_SIZE: u64 = 512;
/// Inode of the filesystem root.
pub const ROOT_INODE: u64 = 1;
/// First inode handed out to entries below the root.
pub const INITIAL_INODE: u64 = 2;
/// FUSE fsname used when none is configured.
pub const DEFAULT_FS_NAME: &str = "mountkeeper";
