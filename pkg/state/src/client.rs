use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::watch::{ChangeFeed, StorageChange};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
}

/// Same-origin key-value store visible to every agent of an identity.
///
/// Reads and writes are synchronous and carry no atomicity across agents:
/// callers do read-then-write and must tolerate interleaving.
pub trait SharedStore: Send + Sync {
    /// Retrieve the value for a key, or `None` if it does not exist.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store a value under the given key.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a key from the store.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Changes made by *other* agents, or `None` where the medium has no
    /// change notifications.
    fn change_feed(&self) -> Option<ChangeFeed>;
}

/// In-memory shared store with one handle per agent.
///
/// Writes through one handle are announced on every other handle's change
/// feed, the way a browser's `storage` event reaches other tabs only.
#[derive(Clone, Default)]
pub struct MemorySharedStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    entries: RwLock<HashMap<String, String>>,
    unavailable: AtomicBool,
    peers: Mutex<Vec<(String, ChangeFeed)>>,
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a handle for one agent.
    pub fn agent(&self, agent_id: &str) -> MemoryStoreHandle {
        let feed = ChangeFeed::new();
        self.inner
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((agent_id.to_string(), feed.clone()));
        MemoryStoreHandle {
            store: self.clone(),
            agent_id: agent_id.to_string(),
            feed,
        }
    }

    /// Simulate the medium becoming unusable (quota, privacy mode, ...).
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Read a key without going through an agent handle.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store disabled".to_string()));
        }
        Ok(())
    }

    fn notify_others(&self, origin: &str, change: StorageChange) {
        let peers = self.inner.peers.lock().unwrap_or_else(PoisonError::into_inner);
        for (agent_id, feed) in peers.iter() {
            if agent_id != origin {
                feed.publish(change.clone());
            }
        }
    }
}

/// One agent's view of a [`MemorySharedStore`].
#[derive(Clone)]
pub struct MemoryStoreHandle {
    store: MemorySharedStore,
    agent_id: String,
    feed: ChangeFeed,
}

impl SharedStore for MemoryStoreHandle {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.store.check_available()?;
        Ok(self.store.peek(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.store.check_available()?;
        self.store
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        debug!("shared store set {} by {}", key, self.agent_id);
        self.store
            .notify_others(&self.agent_id, StorageChange::put(key, value));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.store.check_available()?;
        let removed = self
            .store
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if removed.is_some() {
            debug!("shared store delete {} by {}", key, self.agent_id);
            self.store
                .notify_others(&self.agent_id, StorageChange::delete(key));
        }
        Ok(())
    }

    fn change_feed(&self) -> Option<ChangeFeed> {
        Some(self.feed.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn handles_share_entries() {
        let store = MemorySharedStore::new();
        let a = store.agent("a");
        let b = store.agent("b");
        a.set("k", "v").unwrap();
        assert_eq!(b.get("k").unwrap(), Some("v".to_string()));
        b.delete("k").unwrap();
        assert_eq!(a.get("k").unwrap(), None);
    }

    #[test]
    fn changes_reach_other_agents_only() {
        let store = MemorySharedStore::new();
        let a = store.agent("a");
        let b = store.agent("b");
        let mut a_rx = a.change_feed().unwrap().subscribe();
        let mut b_rx = b.change_feed().unwrap().subscribe();

        a.set("k", "v").unwrap();

        assert_eq!(b_rx.try_recv().unwrap(), StorageChange::put("k", "v"));
        assert!(matches!(a_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn deleting_missing_key_is_silent() {
        let store = MemorySharedStore::new();
        let a = store.agent("a");
        let b = store.agent("b");
        let mut b_rx = b.change_feed().unwrap().subscribe();
        a.delete("missing").unwrap();
        assert!(matches!(b_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn unavailable_store_errors() {
        let store = MemorySharedStore::new();
        let a = store.agent("a");
        store.set_available(false);
        assert!(matches!(a.get("k"), Err(StoreError::Unavailable(_))));
        assert!(a.set("k", "v").is_err());
        store.set_available(true);
        assert!(a.set("k", "v").is_ok());
    }
}
