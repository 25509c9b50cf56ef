use async_trait::async_trait;
use pkg_state::clock::Clock;
use pkg_types::presence::{PresenceState, fields};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

/// A value in a write patch.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    /// Replaced by the store's own clock when the write is applied.
    ServerTimestamp,
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Value(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Value(Value::String(value.to_string()))
    }
}

impl From<PresenceState> for FieldValue {
    fn from(state: PresenceState) -> Self {
        FieldValue::from(state.as_str())
    }
}

/// Field-level changes to one document.
pub type Patch = BTreeMap<String, FieldValue>;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("document store unavailable: {0}")]
    Unavailable(String),
}

/// Remote document store holding one presence document per identity.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Apply `patch` to an existing document; `NotFound` if it is absent.
    async fn update(&self, path: &str, patch: &Patch) -> Result<(), DocumentError>;

    /// Create the document, or merge `seed` into it if it already exists.
    async fn create_with_merge(&self, path: &str, seed: &Patch) -> Result<(), DocumentError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Update,
    Create,
}

/// One write attempt seen by [`MemoryDocumentStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    pub path: String,
    pub kind: WriteKind,
    pub patch: Patch,
    pub accepted: bool,
}

impl DocumentWrite {
    /// Presence state set by this write, if any.
    pub fn state(&self) -> Option<PresenceState> {
        match self.patch.get(fields::STATE) {
            Some(FieldValue::Value(value)) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self.patch.get(fields::SESSION_ID) {
            Some(FieldValue::Value(Value::String(id))) => Some(id),
            _ => None,
        }
    }

    /// A liveness-only write: bumps `lastSeenAt` without touching `state`.
    pub fn is_heartbeat(&self) -> bool {
        self.patch.contains_key(fields::LAST_SEEN_AT) && !self.patch.contains_key(fields::STATE)
    }
}

/// Write attempts kept by [`MemoryDocumentStore`] unless configured otherwise.
pub const WRITE_LOG_CAPACITY: usize = 1024;

/// In-memory document store for tests and the simulator. Keeps the most
/// recent write attempts for inspection.
pub struct MemoryDocumentStore {
    clock: Arc<dyn Clock>,
    docs: RwLock<HashMap<String, Map<String, Value>>>,
    writes: RwLock<VecDeque<DocumentWrite>>,
    write_log_capacity: usize,
    unavailable: AtomicBool,
    reject_creates: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_write_log_capacity(clock, WRITE_LOG_CAPACITY)
    }

    /// Keep at most `capacity` write attempts; older ones are discarded.
    pub fn with_write_log_capacity(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            clock,
            docs: RwLock::new(HashMap::new()),
            writes: RwLock::new(VecDeque::new()),
            write_log_capacity: capacity,
            unavailable: AtomicBool::new(false),
            reject_creates: AtomicBool::new(false),
        }
    }

    /// Make every operation fail with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make document creation fail with `Rejected`.
    pub fn set_reject_creates(&self, reject: bool) {
        self.reject_creates.store(reject, Ordering::SeqCst);
    }

    pub async fn get(&self, path: &str) -> Option<Value> {
        self.docs
            .read()
            .await
            .get(path)
            .map(|doc| Value::Object(doc.clone()))
    }

    pub async fn writes(&self) -> Vec<DocumentWrite> {
        self.writes.read().await.iter().cloned().collect()
    }

    /// Update attempts against `path`: one per presence write issued.
    pub async fn attempts(&self, path: &str) -> Vec<DocumentWrite> {
        self.writes
            .read()
            .await
            .iter()
            .filter(|w| w.path == path && w.kind == WriteKind::Update)
            .cloned()
            .collect()
    }

    async fn record(&self, path: &str, kind: WriteKind, patch: &Patch, accepted: bool) {
        let mut writes = self.writes.write().await;
        if self.write_log_capacity == 0 {
            return;
        }
        while writes.len() >= self.write_log_capacity {
            writes.pop_front();
        }
        writes.push_back(DocumentWrite {
            path: path.to_string(),
            kind,
            patch: patch.clone(),
            accepted,
        });
    }

    fn apply(&self, doc: &mut Map<String, Value>, patch: &Patch) {
        let now = Value::String(self.clock.now().to_rfc3339());
        for (field, value) in patch {
            let value = match value {
                FieldValue::Value(value) => value.clone(),
                FieldValue::ServerTimestamp => now.clone(),
            };
            doc.insert(field.clone(), value);
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn update(&self, path: &str, patch: &Patch) -> Result<(), DocumentError> {
        if self.unavailable.load(Ordering::SeqCst) {
            self.record(path, WriteKind::Update, patch, false).await;
            return Err(DocumentError::Unavailable("offline".to_string()));
        }
        let mut docs = self.docs.write().await;
        let found = match docs.get_mut(path) {
            Some(doc) => {
                self.apply(doc, patch);
                true
            }
            None => false,
        };
        drop(docs);
        self.record(path, WriteKind::Update, patch, found).await;
        if found {
            Ok(())
        } else {
            Err(DocumentError::NotFound(path.to_string()))
        }
    }

    async fn create_with_merge(&self, path: &str, seed: &Patch) -> Result<(), DocumentError> {
        if self.unavailable.load(Ordering::SeqCst) {
            self.record(path, WriteKind::Create, seed, false).await;
            return Err(DocumentError::Unavailable("offline".to_string()));
        }
        if self.reject_creates.load(Ordering::SeqCst) {
            self.record(path, WriteKind::Create, seed, false).await;
            return Err(DocumentError::Rejected("missing or insufficient permissions".to_string()));
        }
        let mut docs = self.docs.write().await;
        let doc = docs.entry(path.to_string()).or_default();
        self.apply(doc, seed);
        drop(docs);
        self.record(path, WriteKind::Create, seed, true).await;
        Ok(())
    }
}
