//! Mount controller.
//!
//! [`MountController::mount`] attaches a filesystem at a host path through a
//! [`MountAuthority`], starts the serve loop on its own thread and waits,
//! bounded by [`MOUNT_TIMEOUT`], for the first of: the kernel acknowledging
//! the mount, the serve loop exiting, or the timeout. The returned [`Mount`]
//! is bound to a child of the caller's [`Scope`]; closing that scope, either
//! through [`Mount::unmount`] or by closing any ancestor, releases the host
//! path exactly once.
//!
//! Releasing escalates until one strategy works:
//!
//! 1. direct unmount of the host path;
//! 2. closing the connection handle;
//! 3. up to [`FORCE_UNMOUNT_ATTEMPTS`] forced unmounts, paced by
//!    [`FORCE_UNMOUNT_DELAY`](super::constants::FORCE_UNMOUNT_DELAY).

use super::authority::{blocking, force_unmount_many_times, MountAuthority};
use super::connection::{Connection, ReadySignal, Serve};
use super::constants::{FORCE_UNMOUNT_ATTEMPTS, MOUNT_TIMEOUT};
use super::error::MountError;
use super::observer::{LogObserver, MountEvent, MountObserver, UnmountStrategy};
use super::policy::AccessPolicy;
use super::scope::Scope;
use log::debug;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tokio::sync::{oneshot, watch};

/// Orchestrates mount authority, serve loop and lifecycle scope.
pub struct MountController<A: MountAuthority> {
    authority: Arc<A>,
    observer: Arc<dyn MountObserver>,
}

impl<A: MountAuthority> MountController<A> {
    /// Creates a controller reporting through the `log` facade.
    pub fn new(authority: A) -> Self {
        Self::with_observer(authority, Arc::new(LogObserver))
    }

    /// Creates a controller reporting to `observer`.
    pub fn with_observer(authority: A, observer: Arc<dyn MountObserver>) -> Self {
        Self {
            authority: Arc::new(authority),
            observer,
        }
    }

    /// The authority used for OS calls.
    pub fn authority(&self) -> &Arc<A> {
        &self.authority
    }

    /// Mounts `fs` at `mountpoint` and returns it once it is serving.
    ///
    /// `allow` must be one of `""`, `"root"` or `"other"`; anything else is
    /// rejected before any OS call. On every failure after the OS mount
    /// succeeded the mount is torn down before the error is returned, so the
    /// caller never holds a half-established mount.
    pub async fn mount(
        &self,
        parent: &Scope,
        fs: Arc<A::Filesystem>,
        mountpoint: impl AsRef<Path>,
        allow: &str,
    ) -> Result<Mount<A::Filesystem>, MountError> {
        let mountpoint = mountpoint.as_ref().to_path_buf();
        let policy: AccessPolicy = allow.parse()?;

        self.observer.on_event(&mountpoint, &MountEvent::Mounting);
        let mut connection = self
            .authority
            .mount(Arc::clone(&fs), &mountpoint, policy)
            .map_err(|e| MountError::mount_failed(&mountpoint, e))?;

        let server = connection.take_server();
        let ready = connection.ready_signal();
        let connection = Arc::new(Mutex::new(connection));
        let unmounter = Unmounter {
            authority: Arc::clone(&self.authority),
            mountpoint: mountpoint.clone(),
            connection: Arc::clone(&connection),
            observer: Arc::clone(&self.observer),
        };

        // Teardown is registered before waiting, so any failure below
        // releases the mount through the scope exactly once.
        let scope = match register_teardown(parent, &unmounter) {
            Ok(scope) => scope,
            Err(err) => {
                self.abort(&mountpoint, &err);
                if let Err(cleanup) = unmounter.run().await {
                    debug!("cleanup of {} failed: {}", mountpoint.display(), cleanup);
                }
                return Err(err);
            }
        };

        let (serving_tx, serving) = watch::channel(true);
        if let Err(err) = self
            .start(&mountpoint, server, ready, &connection, serving_tx)
            .await
        {
            self.abort(&mountpoint, &err);
            if let Err(cleanup) = scope.close().await {
                debug!("cleanup of {} failed: {}", mountpoint.display(), cleanup);
            }
            return Err(err);
        }

        self.observer.on_event(&mountpoint, &MountEvent::Mounted);
        Ok(Mount {
            mountpoint,
            policy,
            filesystem: fs,
            scope,
            serving,
        })
    }

    async fn start(
        &self,
        mountpoint: &Path,
        server: Option<Box<dyn Serve>>,
        ready: ReadySignal,
        connection: &Mutex<Connection>,
        serving: watch::Sender<bool>,
    ) -> Result<(), MountError> {
        let server = server.ok_or_else(|| {
            MountError::serve_failed(
                mountpoint,
                io::Error::new(io::ErrorKind::Other, "connection has no serving half"),
            )
        })?;
        let mut served = spawn_serve_loop(mountpoint, server, serving, Arc::clone(&self.observer))
            .map_err(|e| MountError::serve_failed(mountpoint, e))?;

        tokio::select! {
            _ = tokio::time::sleep(MOUNT_TIMEOUT) => {
                return Err(MountError::MountTimeout {
                    path: mountpoint.to_path_buf(),
                    timeout: MOUNT_TIMEOUT,
                });
            }
            result = &mut served => {
                let err = match result {
                    Ok(Err(e)) => e,
                    Ok(Ok(())) => io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serve loop exited before the mount became ready",
                    ),
                    Err(_) => io::Error::new(io::ErrorKind::Other, "serve loop vanished"),
                };
                return Err(MountError::serve_failed(mountpoint, err));
            }
            ready = ready.wait() => {
                ready.map_err(|e| MountError::mount_failed(mountpoint, e))?;
            }
        }

        // The authority records a deferred error before signalling readiness.
        let deferred = connection.lock().take_mount_error();
        match deferred {
            Some(err) => Err(MountError::mount_failed(mountpoint, err)),
            None => Ok(()),
        }
    }

    fn abort(&self, mountpoint: &Path, err: &MountError) {
        self.observer
            .on_event(mountpoint, &MountEvent::MountAborted { error: err });
    }
}

fn register_teardown<A: MountAuthority>(
    parent: &Scope,
    unmounter: &Unmounter<A>,
) -> Result<Scope, MountError> {
    let scope = parent.child(format!("mount {}", unmounter.mountpoint.display()))?;
    let teardown = unmounter.clone();
    scope.set_teardown(move || teardown.run())?;
    Ok(scope)
}

fn spawn_serve_loop(
    mountpoint: &Path,
    server: Box<dyn Serve>,
    serving: watch::Sender<bool>,
    observer: Arc<dyn MountObserver>,
) -> io::Result<oneshot::Receiver<io::Result<()>>> {
    let (tx, rx) = oneshot::channel();
    let mountpoint = mountpoint.to_path_buf();
    thread::Builder::new()
        .name("mount-serve".to_string())
        .spawn(move || {
            let result = server.serve();
            observer.on_event(&mountpoint, &MountEvent::ServeExited { result: &result });
            serving.send_replace(false);
            let _ = tx.send(result);
        })?;
    Ok(rx)
}

/// Releases one mountpoint, escalating through the unmount strategies.
struct Unmounter<A> {
    authority: Arc<A>,
    mountpoint: PathBuf,
    connection: Arc<Mutex<Connection>>,
    observer: Arc<dyn MountObserver>,
}

impl<A> Clone for Unmounter<A> {
    fn clone(&self) -> Self {
        Self {
            authority: Arc::clone(&self.authority),
            mountpoint: self.mountpoint.clone(),
            connection: Arc::clone(&self.connection),
            observer: Arc::clone(&self.observer),
        }
    }
}

impl<A: MountAuthority> Unmounter<A> {
    async fn run(self) -> Result<(), MountError> {
        let mountpoint = self.mountpoint.as_path();
        self.observer.on_event(mountpoint, &MountEvent::Unmounting);

        let (authority, path) = (Arc::clone(&self.authority), self.mountpoint.clone());
        match blocking(move || authority.unmount(&path)).await {
            Ok(()) => {
                self.released(UnmountStrategy::Direct);
                return Ok(());
            }
            Err(e) => self.failed(UnmountStrategy::Direct, &e),
        }

        let connection = Arc::clone(&self.connection);
        let closed = blocking(move || {
            let result = connection.lock().close();
            result
        });
        match closed.await {
            Ok(()) => {
                self.released(UnmountStrategy::CloseHandle);
                return Ok(());
            }
            Err(e) => self.failed(UnmountStrategy::CloseHandle, &e),
        }

        force_unmount_many_times(
            &self.authority,
            mountpoint,
            FORCE_UNMOUNT_ATTEMPTS,
            self.observer.as_ref(),
        )
        .await
    }

    fn released(&self, strategy: UnmountStrategy) {
        self.observer
            .on_event(&self.mountpoint, &MountEvent::Unmounted { strategy });
    }

    fn failed(&self, strategy: UnmountStrategy, error: &io::Error) {
        self.observer.on_event(
            &self.mountpoint,
            &MountEvent::StrategyFailed { strategy, error },
        );
    }
}

/// An active filesystem attached at a host path.
///
/// The mount lives until its scope closes. Dropping the value does not
/// unmount; the scope tree owns teardown.
pub struct Mount<F> {
    mountpoint: PathBuf,
    policy: AccessPolicy,
    filesystem: Arc<F>,
    scope: Scope,
    serving: watch::Receiver<bool>,
}

impl<F> Mount<F> {
    /// The host path the filesystem is attached at.
    pub fn mount_point(&self) -> &Path {
        &self.mountpoint
    }

    /// The access policy the mount was created with.
    pub fn policy(&self) -> AccessPolicy {
        self.policy
    }

    /// The filesystem being served.
    pub fn filesystem(&self) -> &Arc<F> {
        &self.filesystem
    }

    /// The lifecycle scope owning this mount's teardown.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Releases the host path.
    ///
    /// Only the first call, or the first ancestor close, runs the unmount;
    /// every later call returns that first result.
    pub async fn unmount(&self) -> Result<(), MountError> {
        self.scope.close().await
    }

    /// Whether teardown has started.
    pub fn is_closed(&self) -> bool {
        self.scope.is_closed()
    }

    /// Whether the serve loop is still running.
    pub fn is_serving(&self) -> bool {
        *self.serving.borrow()
    }

    /// Resolves once the serve loop has returned.
    ///
    /// The loop ends on its own when the host path is released behind the
    /// controller's back, e.g. by an external `fusermount -u`. The scope is
    /// still open at that point; closing it releases what is left.
    pub async fn serve_exited(&self) {
        let mut serving = self.serving.clone();
        // A dropped sender means the serve thread is gone as well.
        let _ = serving.wait_for(|serving| !*serving).await;
    }
}

impl<F> fmt::Debug for Mount<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("mountpoint", &self.mountpoint)
            .field("policy", &self.policy)
            .field("scope", &self.scope)
            .field("serving", &self.is_serving())
            .finish()
    }
}
