//! Directory Store port and subscription handles
//!
//! The store is an external collaborator: a shared key/value tree with
//! realtime watches and cleanup-on-disconnect. The core only ever talks to it
//! through [`DirectoryStore`].

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use super::errors::DirectoryResult;
use super::path::DirectoryPath;

/// A change to one leaf record under a watched prefix
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    /// Record created or replaced
    Put { path: DirectoryPath, value: Value },
    /// Record removed
    Removed { path: DirectoryPath },
}

impl DirectoryEvent {
    pub fn path(&self) -> &DirectoryPath {
        match self {
            DirectoryEvent::Put { path, .. } => path,
            DirectoryEvent::Removed { path } => path,
        }
    }
}

/// Shared key/value service with watch and on-disconnect semantics
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Read one leaf record
    async fn get(&self, path: &DirectoryPath) -> DirectoryResult<Option<Value>>;

    /// All leaf records under `prefix`, in key order
    async fn list(&self, prefix: &DirectoryPath) -> DirectoryResult<Vec<(DirectoryPath, Value)>>;

    /// Create or replace a leaf record
    async fn set(&self, path: &DirectoryPath, value: Value) -> DirectoryResult<()>;

    /// Append to an ordered collection. Returns the generated child path,
    /// whose key sorts after every earlier append.
    async fn append(&self, collection: &DirectoryPath, value: Value) -> DirectoryResult<DirectoryPath>;

    /// Remove every record under each of `paths` in one atomic step
    async fn remove(&self, paths: &[DirectoryPath]) -> DirectoryResult<()>;

    /// Have the store remove `path` if this client drops without cleanup
    async fn remove_on_disconnect(&self, path: &DirectoryPath) -> DirectoryResult<()>;

    /// Undo a previous [`remove_on_disconnect`](Self::remove_on_disconnect)
    async fn cancel_on_disconnect(&self, path: &DirectoryPath) -> DirectoryResult<()>;

    /// Watch every leaf under `prefix`. Existing records are replayed as
    /// `Put` events before live changes.
    async fn watch(&self, prefix: &DirectoryPath) -> DirectoryResult<Subscription>;
}

pub type SharedDirectory = Arc<dyn DirectoryStore>;

type DetachFn = Box<dyn FnOnce() + Send>;

/// Cloneable, idempotent detach switch for a [`Subscription`]
#[derive(Clone)]
pub struct DetachHandle {
    detach: Arc<Mutex<Option<DetachFn>>>,
}

impl DetachHandle {
    fn new(detach: DetachFn) -> Self {
        Self {
            detach: Arc::new(Mutex::new(Some(detach))),
        }
    }

    /// Stop delivery. Detaching an already-detached subscription is a no-op.
    pub fn detach(&self) {
        let detach = self
            .detach
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(detach) = detach {
            detach();
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detach
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl std::fmt::Debug for DetachHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetachHandle")
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// Lazy, unbounded sequence of change events under one prefix.
///
/// Dropping the subscription detaches it.
pub struct Subscription {
    prefix: DirectoryPath,
    events: mpsc::UnboundedReceiver<DirectoryEvent>,
    handle: DetachHandle,
}

impl Subscription {
    /// Build a subscription from an event channel and the store-side
    /// unregistration closure.
    pub fn new(
        prefix: DirectoryPath,
        events: mpsc::UnboundedReceiver<DirectoryEvent>,
        detach: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            prefix,
            events,
            handle: DetachHandle::new(Box::new(detach)),
        }
    }

    pub fn prefix(&self) -> &DirectoryPath {
        &self.prefix
    }

    /// Next event, or `None` once detached and drained
    pub async fn next(&mut self) -> Option<DirectoryEvent> {
        if self.handle.is_detached() {
            return None;
        }
        self.events.recv().await
    }

    pub fn detach_handle(&self) -> DetachHandle {
        self.handle.clone()
    }

    pub fn detach(&self) {
        self.handle.detach();
    }

    pub fn is_detached(&self) -> bool {
        self.handle.is_detached()
    }
}

impl Stream for Subscription {
    type Item = DirectoryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.handle.is_detached() {
            return Poll::Ready(None);
        }
        self.events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("prefix", &self.prefix.to_string())
            .field("detached", &self.is_detached())
            .finish()
    }
}
