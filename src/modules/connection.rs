//! Connection handle between the kernel and a serving filesystem.
//!
//! A [`Connection`] is produced by a mount authority once the OS-level mount
//! request succeeded. It is split in two halves:
//!
//! - the serving half ([`Serve`]), moved onto the serve loop thread, which
//!   blocks while requests flow;
//! - the control half, kept by the mount, which tracks the
//!   pending → ready → closed state and can close the channel.
//!
//! The authority reports kernel acknowledgement through the
//! [`ReadyNotifier`] returned alongside the connection.

use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::sync::watch;

/// State of a connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Mount requested, not yet acknowledged by the kernel
    Pending,
    /// Kernel acknowledged, requests may flow
    Ready,
    /// Channel closed
    Closed,
}

/// The serving half of a connection.
///
/// `serve` blocks until the connection closes or the filesystem faults.
pub trait Serve: Send + 'static {
    /// Drive the connection until it closes.
    fn serve(self: Box<Self>) -> io::Result<()>;
}

impl<F> Serve for F
where
    F: FnOnce() -> io::Result<()> + Send + 'static,
{
    fn serve(self: Box<Self>) -> io::Result<()> {
        (*self)()
    }
}

/// Closes the kernel channel of a connection.
///
/// Some drivers treat closing the channel as an implicit unmount.
pub trait Close: Send + 'static {
    /// Close the channel.
    fn close(&mut self) -> io::Result<()>;
}

impl<F> Close for F
where
    F: FnMut() -> io::Result<()> + Send + 'static,
{
    fn close(&mut self) -> io::Result<()> {
        self()
    }
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    mount_error: Mutex<Option<io::Error>>,
}

/// A live kernel/userspace channel, exclusively owned by one mount.
pub struct Connection {
    shared: Arc<Shared>,
    server: Option<Box<dyn Serve>>,
    closer: Box<dyn Close>,
}

impl Connection {
    /// Creates a pending connection from its serving and closing halves.
    pub fn new<S, C>(server: S, closer: C) -> (Self, ReadyNotifier)
    where
        S: Serve,
        C: Close,
    {
        let (state, _) = watch::channel(ConnectionState::Pending);
        let shared = Arc::new(Shared {
            state,
            mount_error: Mutex::new(None),
        });
        let notifier = ReadyNotifier {
            shared: Arc::clone(&shared),
        };
        let connection = Self {
            shared,
            server: Some(Box::new(server)),
            closer: Box::new(closer),
        };
        (connection, notifier)
    }

    /// Current state of the handle.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Takes the serving half. Returns `None` once it has been taken.
    pub fn take_server(&mut self) -> Option<Box<dyn Serve>> {
        self.server.take()
    }

    /// A future-friendly view of the readiness signal.
    pub fn ready_signal(&self) -> ReadySignal {
        ReadySignal {
            rx: self.shared.state.subscribe(),
        }
    }

    /// Waits until the kernel acknowledged the mount.
    pub async fn wait_ready(&self) -> io::Result<()> {
        self.ready_signal().wait().await
    }

    /// Takes the error the OS reported after acknowledging the mount, if any.
    pub fn take_mount_error(&self) -> Option<io::Error> {
        self.shared.mount_error.lock().take()
    }

    /// Closes the channel. Closing an already closed handle is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }
        self.closer.close()?;
        self.shared.state.send_replace(ConnectionState::Closed);
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("server_taken", &self.server.is_none())
            .finish()
    }
}

/// Handed to the mount authority so it can report kernel acknowledgement.
#[derive(Clone)]
pub struct ReadyNotifier {
    shared: Arc<Shared>,
}

impl ReadyNotifier {
    /// Marks the connection ready. Has no effect unless it is still pending.
    pub fn ready(&self) {
        self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Pending {
                *state = ConnectionState::Ready;
                true
            } else {
                false
            }
        });
    }

    /// Marks the connection ready, recording an error the OS reported
    /// alongside the acknowledgement.
    ///
    /// The error is stored before the state flips, so anyone woken by the
    /// ready signal observes it.
    pub fn ready_with_error(&self, err: io::Error) {
        *self.shared.mount_error.lock() = Some(err);
        self.ready();
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        *self.shared.state.borrow() == ConnectionState::Closed
    }
}

/// Resolves once a connection leaves the pending state.
pub struct ReadySignal {
    rx: watch::Receiver<ConnectionState>,
}

impl ReadySignal {
    /// Waits for the ready signal. A connection closed before becoming
    /// ready is reported as `NotConnected`.
    pub async fn wait(mut self) -> io::Result<()> {
        let state = *self
            .rx
            .wait_for(|state| *state != ConnectionState::Pending)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection dropped"))?;
        match state {
            ConnectionState::Ready => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed before it became ready",
            )),
        }
    }
}
