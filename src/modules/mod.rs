//! Core mount control modules.
//!
//! This module provides the main components of the control plane:
//!
//! - `constants`: Timing bounds and filesystem constants
//! - `error`: The mount error taxonomy
//! - `policy`: Access policy parsing
//! - `scope`: Lifecycle scopes with exactly-once teardown
//! - `connection`: Kernel connection handle and readiness signal
//! - `authority`: OS mount and unmount primitives
//! - `observer`: Lifecycle event reporting
//! - `mount`: The mount controller and active mounts
//! - `snapshot`: A read-only snapshot filesystem
//! - `registry`: Records of mounts served by `mntk` processes

pub mod authority;
pub mod connection;
pub mod constants;
pub mod error;
pub mod mount;
pub mod observer;
pub mod policy;
pub mod registry;
pub mod scope;
pub mod snapshot;
