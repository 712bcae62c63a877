//! Scripted mount authority shared by the lifecycle tests.
#![allow(dead_code)]

use mountkeeper::{AccessPolicy, Connection, MountAuthority, MountEvent, MountObserver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// An OS primitive the controller reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Mount,
    Direct,
    Close,
    Force,
}

/// How the kernel acknowledges a mount.
#[derive(Debug, Clone, Copy)]
pub enum Ready {
    Immediately,
    Never,
    WithError(i32),
}

/// Outcome of every primitive, decided up front.
#[derive(Debug, Clone)]
pub struct Script {
    pub mount_error: Option<i32>,
    pub ready: Ready,
    pub serve_error: Option<i32>,
    pub direct_ok: bool,
    pub close_ok: bool,
    /// Forced unmounts fail until this attempt, counted from 1.
    pub force_succeeds_on: Option<usize>,
    /// How long a direct unmount blocks before answering.
    pub unmount_delay: Option<Duration>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            mount_error: None,
            ready: Ready::Immediately,
            serve_error: None,
            direct_ok: true,
            close_ok: true,
            force_succeeds_on: Some(1),
            unmount_delay: None,
        }
    }
}

#[derive(Default)]
struct State {
    calls: Mutex<Vec<Call>>,
    mountpoints: Mutex<Vec<PathBuf>>,
    // Dropping a sender lets that mount's serve loop return.
    release: Mutex<HashMap<PathBuf, mpsc::Sender<()>>>,
}

impl State {
    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn release(&self, mountpoint: &Path) {
        self.release.lock().remove(mountpoint);
    }
}

/// Mount authority whose primitives follow a [`Script`].
#[derive(Clone)]
pub struct MockAuthority {
    script: Script,
    state: Arc<State>,
}

impl MockAuthority {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            state: Arc::new(State::default()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().clone()
    }

    pub fn count(&self, call: Call) -> usize {
        self.calls().into_iter().filter(|c| *c == call).count()
    }

    pub fn unmount_calls(&self) -> usize {
        self.calls().into_iter().filter(|c| *c != Call::Mount).count()
    }

    pub fn mountpoints(&self) -> Vec<PathBuf> {
        self.state.mountpoints.lock().clone()
    }

    /// Ends the serve loop without going through the controller, the way
    /// an external `fusermount -u` would.
    pub fn release_externally(&self, mountpoint: &Path) {
        self.state.release(mountpoint);
    }
}

impl MountAuthority for MockAuthority {
    type Filesystem = String;

    fn mount(
        &self,
        _fs: Arc<String>,
        mountpoint: &Path,
        _policy: AccessPolicy,
    ) -> io::Result<Connection> {
        self.state.record(Call::Mount);
        self.state.mountpoints.lock().push(mountpoint.to_path_buf());
        if let Some(errno) = self.script.mount_error {
            return Err(io::Error::from_raw_os_error(errno));
        }

        let (tx, rx) = mpsc::channel::<()>();
        self.state
            .release
            .lock()
            .insert(mountpoint.to_path_buf(), tx);

        let serve_error = self.script.serve_error;
        let close_ok = self.script.close_ok;
        let state = Arc::clone(&self.state);
        let path = mountpoint.to_path_buf();
        let (connection, notifier) = Connection::new(
            move || {
                if let Some(errno) = serve_error {
                    return Err(io::Error::from_raw_os_error(errno));
                }
                let _ = rx.recv();
                Ok(())
            },
            move || {
                state.record(Call::Close);
                if close_ok {
                    state.release(&path);
                    Ok(())
                } else {
                    Err(io::Error::from_raw_os_error(libc::EBUSY))
                }
            },
        );

        match self.script.ready {
            Ready::Immediately => notifier.ready(),
            Ready::Never => {}
            Ready::WithError(errno) => {
                notifier.ready_with_error(io::Error::from_raw_os_error(errno))
            }
        }
        Ok(connection)
    }

    fn unmount(&self, mountpoint: &Path) -> io::Result<()> {
        self.state.record(Call::Direct);
        if let Some(delay) = self.script.unmount_delay {
            thread::sleep(delay);
        }
        if self.script.direct_ok {
            self.state.release(mountpoint);
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EBUSY))
        }
    }

    fn force_unmount(&self, mountpoint: &Path) -> io::Result<()> {
        self.state.record(Call::Force);
        let attempt = self.count(Call::Force);
        match self.script.force_succeeds_on {
            Some(n) if attempt >= n => {
                self.state.release(mountpoint);
                Ok(())
            }
            _ => Err(io::Error::from_raw_os_error(libc::EBUSY)),
        }
    }
}

/// Keeps a textual trace of lifecycle events.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl MountObserver for RecordingObserver {
    fn on_event(&self, _mountpoint: &Path, event: &MountEvent<'_>) {
        let line = match event {
            MountEvent::Mounting => "mounting".to_string(),
            MountEvent::Mounted => "mounted".to_string(),
            MountEvent::MountAborted { .. } => "aborted".to_string(),
            // Reported from the serve thread, so its position is not fixed.
            MountEvent::ServeExited { .. } => return,
            MountEvent::Unmounting => "unmounting".to_string(),
            MountEvent::StrategyFailed { strategy, .. } => format!("failed: {}", strategy),
            MountEvent::ForceAttempt { attempt } => format!("force #{}", attempt),
            MountEvent::Unmounted { strategy } => format!("unmounted: {}", strategy),
            MountEvent::UnmountFailed { attempts, .. } => format!("gave up after {}", attempts),
        };
        self.events.lock().push(line);
    }
}
