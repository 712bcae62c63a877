#![doc(html_root_url = "https://docs.rs/mountkeeper/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! mountkeeper: mount lifecycle control for FUSE filesystems
//!
//! Attaches a filesystem at a host path, confirms it is serving within a
//! bounded time, and guarantees the host path is released exactly once,
//! escalating from a plain unmount to closing the connection to repeated
//! forced unmounts.
//!
//! ## Features
//!
//! - Bounded startup: kernel readiness, serve loop failure or timeout
//! - Access policies (`""`, `"root"`, `"other"`) validated before any OS call
//! - Lifecycle scopes: closing a parent releases every mount below it
//! - Unmount escalation with observable strategy transitions
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mountkeeper::{FuseAuthority, MountController, Scope, SnapshotFs};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let node = Scope::root("node");
//! let fs = SnapshotFs::new("/srv/blocks")?;
//! let controller = MountController::new(FuseAuthority::new());
//!
//! let mount = controller.mount(&node, Arc::new(fs), "/mnt/blocks", "other").await?;
//! println!("serving at {}", mount.mount_point().display());
//!
//! // Closing the node scope unmounts everything it owns.
//! node.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Unmount strategies
//!
//! - `Direct`: plain unmount of the host path
//! - `CloseHandle`: closing the kernel connection
//! - `Force`: up to ten forced unmounts, half a second apart

pub mod modules;

pub use modules::authority::{force_unmount_many_times, FuseAuthority, MountAuthority};
pub use modules::connection::{Connection, ConnectionState, ReadyNotifier};
pub use modules::error::MountError;
pub use modules::mount::{Mount, MountController};
pub use modules::observer::{LogObserver, MountEvent, MountObserver, UnmountStrategy};
pub use modules::policy::AccessPolicy;
pub use modules::registry::{MountRecord, Registry};
pub use modules::scope::Scope;
pub use modules::snapshot::SnapshotFs;
