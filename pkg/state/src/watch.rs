use tokio::sync::broadcast;

/// A change to the shared store made by another agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    /// Changed key, or `None` when the whole store was cleared
    pub key: Option<String>,
    /// Value after the change, `None` for a delete
    pub new_value: Option<String>,
}

impl StorageChange {
    pub fn put(key: &str, value: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            new_value: Some(value.to_string()),
        }
    }

    pub fn delete(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            new_value: None,
        }
    }

    /// Whether this change may have touched `key`.
    pub fn affects(&self, key: &str) -> bool {
        self.key.as_deref().is_none_or(|k| k == key)
    }

    pub fn is_delete(&self) -> bool {
        self.new_value.is_none()
    }
}

/// Multicast feed of storage changes. Cloning shares the same channel;
/// each subscriber gets its own receiver.
#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<StorageChange>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Publish a change (ignored if nobody is listening).
    pub fn publish(&self, change: StorageChange) {
        let _ = self.sender.send(change);
    }

    /// Subscribe to changes published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.sender.subscribe()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_affects_every_key() {
        let clear = StorageChange {
            key: None,
            new_value: None,
        };
        assert!(clear.affects("presence_leader:u1"));
        assert!(StorageChange::put("a", "1").affects("a"));
        assert!(!StorageChange::put("a", "1").affects("b"));
    }

    #[tokio::test]
    async fn feed_multicasts_to_all_subscribers() {
        let feed = ChangeFeed::new();
        let mut rx1 = feed.subscribe();
        let mut rx2 = feed.clone().subscribe();
        feed.publish(StorageChange::delete("k"));
        assert_eq!(rx1.recv().await.unwrap(), StorageChange::delete("k"));
        assert_eq!(rx2.recv().await.unwrap(), StorageChange::delete("k"));
    }
}
