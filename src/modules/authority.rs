//! Mount point authority.
//!
//! The authority owns the OS-level primitives: attaching a filesystem at a
//! host path, and releasing the host path again. The controller in
//! [`super::mount`] only ever reaches the OS through a [`MountAuthority`],
//! which keeps the escalation logic independent of the platform and lets
//! tests script every primitive.
//!
//! [`FuseAuthority`] is the FUSE binding built on `fuser`.

use super::connection::{Connection, ReadyNotifier};
use super::constants::{DEFAULT_FS_NAME, FORCE_UNMOUNT_DELAY, MOUNT_TIMEOUT, READY_POLL_INTERVAL};
use super::error::MountError;
use super::observer::{MountEvent, MountObserver, UnmountStrategy};
use super::policy::AccessPolicy;
use fuser::{MountOption, Session};
use log::debug;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// OS-level mount and unmount capability.
pub trait MountAuthority: Send + Sync + 'static {
    /// The filesystem implementation this authority can serve.
    type Filesystem: Send + Sync + 'static;

    /// Attaches `fs` at `mountpoint` and returns the pending connection.
    fn mount(
        &self,
        fs: Arc<Self::Filesystem>,
        mountpoint: &Path,
        policy: AccessPolicy,
    ) -> io::Result<Connection>;

    /// Plain unmount of the host path.
    fn unmount(&self, mountpoint: &Path) -> io::Result<()> {
        unmount_path(mountpoint)
    }

    /// A single forced unmount, which may involve a privileged helper.
    fn force_unmount(&self, mountpoint: &Path) -> io::Result<()> {
        force_unmount(mountpoint)
    }
}

/// Mounts `fuser` filesystems.
///
/// The filesystem is cloned into the FUSE session, the same way a cloneable
/// filesystem with shared interior state is handed to `fuser::mount2`.
pub struct FuseAuthority<F> {
    fs_name: String,
    _fs: PhantomData<fn() -> F>,
}

impl<F> FuseAuthority<F> {
    /// Creates an authority using the default FUSE fsname.
    pub fn new() -> Self {
        Self::with_fs_name(DEFAULT_FS_NAME)
    }

    /// Creates an authority reporting `fs_name` as the FUSE fsname.
    pub fn with_fs_name(fs_name: impl Into<String>) -> Self {
        Self {
            fs_name: fs_name.into(),
            _fs: PhantomData,
        }
    }

    /// The FUSE fsname used for new mounts.
    pub fn fs_name(&self) -> &str {
        &self.fs_name
    }

    fn mount_options(&self, policy: AccessPolicy) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(self.fs_name.clone()),
            MountOption::DefaultPermissions,
        ];
        options.extend(policy.mount_options());
        options
    }
}

impl<F> Default for FuseAuthority<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> MountAuthority for FuseAuthority<F>
where
    F: fuser::Filesystem + Clone + Send + Sync + 'static,
{
    type Filesystem = F;

    fn mount(
        &self,
        fs: Arc<F>,
        mountpoint: &Path,
        policy: AccessPolicy,
    ) -> io::Result<Connection> {
        let unmounted_dev = fs::metadata(mountpoint)?.dev();
        let options = self.mount_options(policy);
        debug!("fuse mount {} with {:?}", mountpoint.display(), options);

        let mut session = Session::new(F::clone(&fs), mountpoint, &options)?;
        let mut unmounter = session.unmount_callable();
        let (connection, notifier) = Connection::new(
            move || {
                let mut session = session;
                session.run()
            },
            move || unmounter.unmount(),
        );

        spawn_ready_watch(mountpoint.to_path_buf(), unmounted_dev, notifier, MOUNT_TIMEOUT)?;
        Ok(connection)
    }
}

/// Watches the mountpoint until the kernel reports the new filesystem.
///
/// The first `stat` after attaching blocks until the serve loop answers the
/// kernel's handshake; once the device differs from the one the directory
/// had before mounting, the mount is live. A `stat` error at that point is
/// the deferred mount error. The watcher gives up silently after `timeout`.
fn spawn_ready_watch(
    mountpoint: PathBuf,
    unmounted_dev: u64,
    notifier: ReadyNotifier,
    timeout: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("mount-ready-watch".to_string())
        .spawn(move || {
            let deadline = Instant::now() + timeout;
            while !notifier.is_closed() {
                match fs::metadata(&mountpoint) {
                    Ok(meta) if meta.dev() != unmounted_dev => {
                        notifier.ready();
                        return;
                    }
                    Ok(_) if Instant::now() < deadline => thread::sleep(READY_POLL_INTERVAL),
                    Ok(_) => return,
                    Err(e) => {
                        notifier.ready_with_error(e);
                        return;
                    }
                }
            }
        })
}

/// Plain unmount syscall for `mountpoint`.
pub fn unmount_path(mountpoint: &Path) -> io::Result<()> {
    sys_unmount(mountpoint, false)
}

/// One forced unmount: `MNT_FORCE` first, then the platform helper.
pub fn force_unmount(mountpoint: &Path) -> io::Result<()> {
    match sys_unmount(mountpoint, true) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("forced unmount of {} failed: {}", mountpoint.display(), e);
            run_helper(unmount_helper(mountpoint))
        }
    }
}

/// Retries [`MountAuthority::force_unmount`] up to `attempts` times, pacing
/// attempts by [`FORCE_UNMOUNT_DELAY`] so busy mounts can drain.
///
/// Returns [`MountError::UnmountFailed`] carrying the last error once every
/// attempt failed.
pub async fn force_unmount_many_times<A: MountAuthority>(
    authority: &Arc<A>,
    mountpoint: &Path,
    attempts: usize,
    observer: &dyn MountObserver,
) -> Result<(), MountError> {
    if attempts == 0 {
        return Err(MountError::InvalidConfiguration(
            "forced unmount needs at least one attempt".to_string(),
        ));
    }

    let mut last_err = None;
    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(FORCE_UNMOUNT_DELAY).await;
        }
        observer.on_event(mountpoint, &MountEvent::ForceAttempt { attempt });
        let (authority, path) = (Arc::clone(authority), mountpoint.to_path_buf());
        match blocking(move || authority.force_unmount(&path)).await {
            Ok(()) => {
                observer.on_event(
                    mountpoint,
                    &MountEvent::Unmounted {
                        strategy: UnmountStrategy::Force,
                    },
                );
                return Ok(());
            }
            Err(e) => {
                observer.on_event(
                    mountpoint,
                    &MountEvent::StrategyFailed {
                        strategy: UnmountStrategy::Force,
                        error: &e,
                    },
                );
                last_err = Some(e);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::Other));
    observer.on_event(
        mountpoint,
        &MountEvent::UnmountFailed {
            attempts,
            error: &err,
        },
    );
    Err(MountError::unmount_failed(mountpoint, attempts, err))
}

/// Runs an OS primitive on the blocking pool so slow unmounts and helper
/// processes do not stall the runtime.
pub(crate) async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

#[cfg(target_os = "linux")]
fn sys_unmount(mountpoint: &Path, force: bool) -> io::Result<()> {
    use nix::mount::{umount2, MntFlags};

    let flags = if force {
        MntFlags::MNT_FORCE
    } else {
        MntFlags::empty()
    };
    umount2(mountpoint, flags).map_err(io::Error::from)
}

#[cfg(target_os = "macos")]
fn sys_unmount(mountpoint: &Path, force: bool) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(mountpoint.as_os_str().as_bytes())?;
    let flags = if force { libc::MNT_FORCE } else { 0 };
    if unsafe { libc::unmount(c_path.as_ptr(), flags) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn sys_unmount(_mountpoint: &Path, _force: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "unmounting is not supported on this platform",
    ))
}

#[cfg(target_os = "macos")]
fn unmount_helper(mountpoint: &Path) -> Command {
    let mut cmd = Command::new("diskutil");
    cmd.arg("umount").arg("force").arg(mountpoint);
    cmd
}

#[cfg(not(target_os = "macos"))]
fn unmount_helper(mountpoint: &Path) -> Command {
    let mut cmd = Command::new("fusermount");
    cmd.arg("-u").arg(mountpoint);
    cmd
}

fn run_helper(mut cmd: Command) -> io::Result<()> {
    let output = cmd.output()?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(io::Error::new(
        io::ErrorKind::Other,
        format!(
            "{} exited with {}: {}",
            cmd.get_program().to_string_lossy(),
            output.status,
            stderr.trim()
        ),
    ))
}
