//! Lifecycle scopes.
//!
//! A [`Scope`] is a cancellable unit of ownership. Scopes form a tree: a
//! child is linked to its parent and closing a parent closes every child
//! first. Each scope holds at most one teardown routine, and the scope
//! guarantees that routine runs at most once no matter how many callers
//! close it, concurrently or later, or whether the close comes from a
//! parent.
//!
//! Every caller of [`Scope::close`] awaits the same single execution and
//! receives a clone of its result. Dropping a caller's future does not
//! abort the close: the next caller picks it up where it stopped.

use super::error::MountError;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use uuid::Uuid;

type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), MountError>> + Send>;
type CloseFuture = Shared<BoxFuture<'static, Result<(), MountError>>>;

struct State {
    children: Vec<Scope>,
    teardown: Option<Teardown>,
    closing: Option<CloseFuture>,
}

struct Inner {
    id: Uuid,
    name: String,
    parent: Option<Weak<Inner>>,
    state: Mutex<State>,
    done: watch::Sender<bool>,
}

/// A node in the lifecycle tree.
///
/// Cloning a `Scope` yields another handle to the same node.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

impl Scope {
    /// Creates a scope with no parent, typically owned by the process.
    pub fn root(name: impl Into<String>) -> Self {
        Self::new(name.into(), None)
    }

    fn new(name: String, parent: Option<Weak<Inner>>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                name,
                parent,
                state: Mutex::new(State {
                    children: Vec::new(),
                    teardown: None,
                    closing: None,
                }),
                done,
            }),
        }
    }

    /// Links a new scope below this one.
    ///
    /// Fails with [`MountError::Closed`] once this scope has started closing.
    pub fn child(&self, name: impl Into<String>) -> Result<Scope, MountError> {
        let mut state = self.inner.state.lock();
        if state.closing.is_some() {
            return Err(MountError::Closed(self.inner.name.clone()));
        }
        let child = Scope::new(name.into(), Some(Arc::downgrade(&self.inner)));
        state.children.push(child.clone());
        Ok(child)
    }

    /// Registers the routine run when this scope closes.
    ///
    /// A scope holds a single teardown; registering a second one is rejected.
    pub fn set_teardown<F, Fut>(&self, teardown: F) -> Result<(), MountError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), MountError>> + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.closing.is_some() {
            return Err(MountError::Closed(self.inner.name.clone()));
        }
        if state.teardown.is_some() {
            return Err(MountError::InvalidConfiguration(format!(
                "scope {} already has a teardown",
                self.inner.name
            )));
        }
        state.teardown = Some(Box::new(move || teardown().boxed()));
        Ok(())
    }

    /// Closes this scope and all of its descendants.
    ///
    /// Children close first, concurrently, then the teardown runs, then the
    /// scope detaches from its parent. Returns the teardown's error if there
    /// was one, otherwise the first child error.
    pub async fn close(&self) -> Result<(), MountError> {
        self.close_future().await
    }

    /// Starts the close if needed and returns the shared execution.
    ///
    /// Returns a nameable future so `run_close` can join its children
    /// without a recursive opaque type.
    fn close_future(&self) -> CloseFuture {
        let mut state = self.inner.state.lock();
        if let Some(close) = state.closing.clone() {
            return close;
        }
        let children = std::mem::take(&mut state.children);
        let teardown = state.teardown.take();
        let close = run_close(
            self.inner.name.clone(),
            self.inner.id,
            self.inner.parent.clone(),
            Arc::downgrade(&self.inner),
            children,
            teardown,
        )
        .boxed()
        .shared();
        state.closing = Some(close.clone());
        close
    }

    /// Waits until a close of this scope has completed.
    pub async fn closed(&self) {
        let mut done = self.inner.done.subscribe();
        // The sender lives as long as `self`, so this only returns once done.
        let _ = done.wait_for(|done| *done).await;
    }

    /// Whether this scope has started closing.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closing.is_some()
    }

    /// Unique identity of this scope.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Name given at creation.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of children still linked to this scope.
    pub fn child_count(&self) -> usize {
        self.inner.state.lock().children.len()
    }
}

async fn run_close(
    name: String,
    id: Uuid,
    parent: Option<Weak<Inner>>,
    this: Weak<Inner>,
    children: Vec<Scope>,
    teardown: Option<Teardown>,
) -> Result<(), MountError> {
    debug!("Closing scope {} ({} children)", name, children.len());

    let child_results = join_all(children.iter().map(|child| child.close_future())).await;
    for err in child_results.iter().filter_map(|r| r.as_ref().err()) {
        warn!("Scope {}: child failed to close: {}", name, err);
    }

    let result = match teardown {
        Some(teardown) => teardown().await,
        None => Ok(()),
    };

    if let Some(parent) = parent.and_then(|p| p.upgrade()) {
        parent
            .state
            .lock()
            .children
            .retain(|child| child.inner.id != id);
    }
    if let Some(this) = this.upgrade() {
        this.done.send_replace(true);
    }

    debug!("Closed scope {}", name);
    result?;
    child_results.into_iter().collect()
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
