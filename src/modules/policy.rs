//! Access policy for a mount.
//!
//! Decides who besides the mounting user may reach the mounted filesystem.
//! The policy is parsed once, before any OS call, and never changes for
//! the lifetime of a mount.

use super::error::MountError;
use fuser::MountOption;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Represents who may access a mounted filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessPolicy {
    /// Only the mounting user
    #[default]
    #[serde(rename = "default")]
    Default,
    /// The mounting user and root
    #[serde(rename = "root")]
    AllowRoot,
    /// Every user on the host
    #[serde(rename = "other")]
    AllowOther,
}

impl AccessPolicy {
    /// The string accepted by [`AccessPolicy::from_str`] for this policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessPolicy::Default => "",
            AccessPolicy::AllowRoot => "root",
            AccessPolicy::AllowOther => "other",
        }
    }

    /// FUSE mount options implementing this policy.
    pub fn mount_options(&self) -> Vec<MountOption> {
        match self {
            AccessPolicy::Default => Vec::new(),
            AccessPolicy::AllowRoot => vec![MountOption::AllowRoot],
            AccessPolicy::AllowOther => vec![MountOption::AllowOther],
        }
    }
}

impl FromStr for AccessPolicy {
    type Err = MountError;

    fn from_str(allow: &str) -> Result<Self, Self::Err> {
        match allow {
            "" => Ok(AccessPolicy::Default),
            "root" => Ok(AccessPolicy::AllowRoot),
            "other" => Ok(AccessPolicy::AllowOther),
            other => Err(MountError::InvalidConfiguration(format!(
                "unknown allow value {:?}, valid values are 'root' and 'other'",
                other
            ))),
        }
    }
}

impl fmt::Display for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessPolicy::Default => write!(f, "default"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}
