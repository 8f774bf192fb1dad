//! In-memory Directory Store
//!
//! Stands in for the hosted realtime database in tests and in the CLI
//! simulator. One [`MemoryDirectory`] is the shared store; every client gets
//! its own [`MemoryDirectoryClient`] session from [`MemoryDirectory::connect`]
//! so that on-disconnect cleanup can be scoped and triggered per client.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::errors::{DirectoryError, DirectoryResult};
use super::path::DirectoryPath;
use super::store::{DirectoryEvent, DirectoryStore, Subscription};

struct Watcher {
    session: u64,
    prefix: DirectoryPath,
    tx: mpsc::UnboundedSender<DirectoryEvent>,
}

struct Fault {
    prefix: DirectoryPath,
    remaining: u32,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<DirectoryPath, Value>,
    watchers: HashMap<u64, Watcher>,
    next_watcher: u64,
    next_push: u64,
    next_session: u64,
    on_disconnect: HashMap<u64, BTreeSet<DirectoryPath>>,
    disconnected: HashSet<u64>,
    faults: Vec<Fault>,
}

impl State {
    fn notify(&mut self, event: DirectoryEvent) {
        let mut gone = Vec::new();
        for (id, watcher) in &self.watchers {
            if event.path().starts_with(&watcher.prefix) && watcher.tx.send(event.clone()).is_err() {
                gone.push(*id);
            }
        }
        for id in gone {
            self.watchers.remove(&id);
        }
    }

    fn put(&mut self, path: &DirectoryPath, value: Value) {
        // Writing a leaf replaces anything that was stored beneath it.
        let below: Vec<DirectoryPath> = self
            .entries
            .range(path.clone()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(path))
            .filter(|k| *k != path)
            .cloned()
            .collect();
        for key in below {
            self.entries.remove(&key);
            self.notify(DirectoryEvent::Removed { path: key });
        }
        self.entries.insert(path.clone(), value.clone());
        self.notify(DirectoryEvent::Put {
            path: path.clone(),
            value,
        });
    }

    fn remove_subtree(&mut self, path: &DirectoryPath) {
        let doomed: Vec<DirectoryPath> = self
            .entries
            .range(path.clone()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(path))
            .cloned()
            .collect();
        for key in doomed {
            self.entries.remove(&key);
            self.notify(DirectoryEvent::Removed { path: key });
        }
    }

    fn check_fault(&mut self, path: &DirectoryPath) -> DirectoryResult<()> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.remaining > 0 && path.starts_with(&f.prefix));
        match fault {
            Some(fault) => {
                fault.remaining -= 1;
                Err(DirectoryError::Unavailable(format!("injected write failure at {path}")))
            }
            None => Ok(()),
        }
    }

    fn check_session(&self, session: u64) -> DirectoryResult<()> {
        if self.disconnected.contains(&session) {
            return Err(DirectoryError::Disconnected);
        }
        Ok(())
    }
}

struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared in-memory store
#[derive(Clone)]
pub struct MemoryDirectory {
    inner: Arc<Inner>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Open a new client session against this store
    pub fn connect(&self) -> MemoryDirectoryClient {
        let mut state = self.inner.state();
        state.next_session += 1;
        MemoryDirectoryClient {
            inner: Arc::clone(&self.inner),
            session: state.next_session,
        }
    }

    /// Make the next `count` writes under `prefix` fail, from any session
    pub fn fail_writes(&self, prefix: DirectoryPath, count: u32) {
        self.inner.state().faults.push(Fault {
            prefix,
            remaining: count,
        });
    }

    /// Synchronous view of the records under `prefix`
    pub fn entries_under(&self, prefix: &DirectoryPath) -> Vec<(DirectoryPath, Value)> {
        self.inner
            .state()
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn contains(&self, path: &DirectoryPath) -> bool {
        self.inner.state().entries.contains_key(path)
    }

    /// Live watchers whose prefix lies under `prefix`
    pub fn watcher_count(&self, prefix: &DirectoryPath) -> usize {
        self.inner
            .state()
            .watchers
            .values()
            .filter(|w| w.prefix.starts_with(prefix) && !w.tx.is_closed())
            .count()
    }
}

/// One client's session with a [`MemoryDirectory`]
#[derive(Clone)]
pub struct MemoryDirectoryClient {
    inner: Arc<Inner>,
    session: u64,
}

impl MemoryDirectoryClient {
    /// Simulate the client dropping without cleanup: the store runs this
    /// session's on-disconnect removals atomically, ends its watches and
    /// refuses further requests from it.
    pub fn disconnect(&self) {
        let mut state = self.inner.state();
        if !state.disconnected.insert(self.session) {
            return;
        }
        let pending = state.on_disconnect.remove(&self.session).unwrap_or_default();
        debug!(session = self.session, removals = pending.len(), "Directory session dropped");
        for path in &pending {
            state.remove_subtree(path);
        }
        let session = self.session;
        state.watchers.retain(|_, w| w.session != session);
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.state().disconnected.contains(&self.session)
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectoryClient {
    async fn get(&self, path: &DirectoryPath) -> DirectoryResult<Option<Value>> {
        let state = self.inner.state();
        state.check_session(self.session)?;
        Ok(state.entries.get(path).cloned())
    }

    async fn list(&self, prefix: &DirectoryPath) -> DirectoryResult<Vec<(DirectoryPath, Value)>> {
        let state = self.inner.state();
        state.check_session(self.session)?;
        Ok(state
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set(&self, path: &DirectoryPath, value: Value) -> DirectoryResult<()> {
        let mut state = self.inner.state();
        state.check_session(self.session)?;
        state.check_fault(path)?;
        trace!(%path, "set");
        state.put(path, value);
        Ok(())
    }

    async fn append(&self, collection: &DirectoryPath, value: Value) -> DirectoryResult<DirectoryPath> {
        let mut state = self.inner.state();
        state.check_session(self.session)?;
        state.check_fault(collection)?;
        state.next_push += 1;
        let path = collection.child(format!("{:016}", state.next_push));
        trace!(%path, "append");
        state.put(&path, value);
        Ok(path)
    }

    async fn remove(&self, paths: &[DirectoryPath]) -> DirectoryResult<()> {
        let mut state = self.inner.state();
        state.check_session(self.session)?;
        for path in paths {
            state.check_fault(path)?;
        }
        for path in paths {
            trace!(%path, "remove");
            state.remove_subtree(path);
        }
        Ok(())
    }

    async fn remove_on_disconnect(&self, path: &DirectoryPath) -> DirectoryResult<()> {
        let mut state = self.inner.state();
        state.check_session(self.session)?;
        state
            .on_disconnect
            .entry(self.session)
            .or_default()
            .insert(path.clone());
        Ok(())
    }

    async fn cancel_on_disconnect(&self, path: &DirectoryPath) -> DirectoryResult<()> {
        let mut state = self.inner.state();
        state.check_session(self.session)?;
        if let Some(paths) = state.on_disconnect.get_mut(&self.session) {
            paths.remove(path);
        }
        Ok(())
    }

    async fn watch(&self, prefix: &DirectoryPath) -> DirectoryResult<Subscription> {
        let mut state = self.inner.state();
        state.check_session(self.session)?;

        let (tx, rx) = mpsc::unbounded_channel();
        for (path, value) in state.entries.iter().filter(|(k, _)| k.starts_with(prefix)) {
            let _ = tx.send(DirectoryEvent::Put {
                path: path.clone(),
                value: value.clone(),
            });
        }

        state.next_watcher += 1;
        let id = state.next_watcher;
        state.watchers.insert(
            id,
            Watcher {
                session: self.session,
                prefix: prefix.clone(),
                tx,
            },
        );

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(prefix.clone(), rx, move || {
            if let Some(inner) = inner.upgrade() {
                inner.state().watchers.remove(&id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> DirectoryPath {
        DirectoryPath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = MemoryDirectory::new();
        let client = store.connect();

        client.set(&path("channels/01/offers/alice"), json!({"sdp": "x"})).await.unwrap();
        assert_eq!(
            client.get(&path("channels/01/offers/alice")).await.unwrap(),
            Some(json!({"sdp": "x"}))
        );

        client.remove(&[path("channels/01/offers")]).await.unwrap();
        assert!(client.get(&path("channels/01/offers/alice")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_preserves_publish_order() {
        let store = MemoryDirectory::new();
        let client = store.connect();
        let collection = path("channels/01/candidates/alice");

        for n in 0..12 {
            client.append(&collection, json!(n)).await.unwrap();
        }

        let values: Vec<Value> = client
            .list(&collection)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(values, (0..12).map(|n| json!(n)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_watch_replays_then_streams() {
        let store = MemoryDirectory::new();
        let client = store.connect();
        client.set(&path("channels/01/presence/alice"), json!(1)).await.unwrap();

        let mut sub = client.watch(&path("channels/01/presence")).await.unwrap();
        client.set(&path("channels/01/presence/bob"), json!(2)).await.unwrap();
        client.set(&path("channels/02/presence/carol"), json!(3)).await.unwrap();
        client.remove(&[path("channels/01/presence/alice")]).await.unwrap();

        assert_eq!(
            sub.next().await,
            Some(DirectoryEvent::Put { path: path("channels/01/presence/alice"), value: json!(1) })
        );
        assert_eq!(
            sub.next().await,
            Some(DirectoryEvent::Put { path: path("channels/01/presence/bob"), value: json!(2) })
        );
        assert_eq!(
            sub.next().await,
            Some(DirectoryEvent::Removed { path: path("channels/01/presence/alice") })
        );
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let store = MemoryDirectory::new();
        let client = store.connect();
        let prefix = path("channels/01/offers");
        let mut sub = client.watch(&prefix).await.unwrap();
        assert_eq!(store.watcher_count(&prefix), 1);

        sub.detach();
        sub.detach();
        sub.detach_handle().detach();
        assert!(sub.is_detached());
        assert_eq!(store.watcher_count(&prefix), 0);

        client.set(&path("channels/01/offers/alice"), json!(1)).await.unwrap();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_subscription_detaches() {
        let store = MemoryDirectory::new();
        let client = store.connect();
        let prefix = path("channels/01");
        let sub = client.watch(&prefix).await.unwrap();
        drop(sub);
        assert_eq!(store.watcher_count(&prefix), 0);
    }

    #[tokio::test]
    async fn test_disconnect_runs_cleanup_and_rejects_session() {
        let store = MemoryDirectory::new();
        let alice = store.connect();
        let bob = store.connect();
        let presence = path("channels/01/presence/alice");

        alice.set(&presence, json!({"label": "alice"})).await.unwrap();
        alice.remove_on_disconnect(&presence).await.unwrap();
        let mut watch = bob.watch(&path("channels/01/presence")).await.unwrap();
        assert!(matches!(watch.next().await, Some(DirectoryEvent::Put { .. })));

        alice.disconnect();

        assert!(!store.contains(&presence));
        assert_eq!(watch.next().await, Some(DirectoryEvent::Removed { path: presence.clone() }));
        assert_eq!(
            alice.set(&presence, json!(1)).await.unwrap_err(),
            DirectoryError::Disconnected
        );
        assert!(alice.is_disconnected());
        assert!(!bob.is_disconnected());
    }

    #[tokio::test]
    async fn test_cancelled_disconnect_hook_keeps_record() {
        let store = MemoryDirectory::new();
        let alice = store.connect();
        let presence = path("channels/01/presence/alice");

        alice.set(&presence, json!(1)).await.unwrap();
        alice.remove_on_disconnect(&presence).await.unwrap();
        alice.cancel_on_disconnect(&presence).await.unwrap();
        alice.disconnect();

        assert!(store.contains(&presence));
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let store = MemoryDirectory::new();
        let client = store.connect();
        store.fail_writes(path("channels/01/offers"), 1);

        let offer = path("channels/01/offers/alice");
        assert!(matches!(
            client.set(&offer, json!(1)).await,
            Err(DirectoryError::Unavailable(_))
        ));
        client.set(&offer, json!(1)).await.unwrap();
        client.set(&path("channels/01/presence/alice"), json!(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_replaces_subtree() {
        let store = MemoryDirectory::new();
        let client = store.connect();
        client.append(&path("channels/01/candidates/alice"), json!(1)).await.unwrap();
        client.set(&path("channels/01/candidates/alice"), json!("flat")).await.unwrap();

        let entries = store.entries_under(&path("channels/01/candidates"));
        assert_eq!(entries, vec![(path("channels/01/candidates/alice"), json!("flat"))]);
    }
}
