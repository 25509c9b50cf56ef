//! Multi-agent fixtures over in-memory stores and paused tokio time.

use pkg_constants::state::leader_lease_key;
use pkg_signals::{EnvironmentSignals, Network, Platform, PlatformBridge, Visibility};
use pkg_state::client::{MemorySharedStore, SharedStore};
use pkg_state::clock::{Clock, TokioClock};
use pkg_state::leader::LeaderElection;
use pkg_types::config::PresenceConfig;
use pkg_types::lease::Lease;
use pkg_types::presence::PresenceState;
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::PresenceCoordinator;
use crate::document::{DocumentError, DocumentStore, MemoryDocumentStore, Patch};
use crate::sink::RecordingErrorSink;
use crate::writer::PresenceWriter;

pub(crate) struct Harness {
    pub store: MemorySharedStore,
    pub docs: Arc<MemoryDocumentStore>,
    pub clock: Arc<TokioClock>,
    pub sink: Arc<RecordingErrorSink>,
}

pub(crate) struct TestAgent {
    pub coordinator: PresenceCoordinator,
    pub platform: PlatformBridge,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(TokioClock::new());
        Self {
            store: MemorySharedStore::new(),
            docs: Arc::new(MemoryDocumentStore::new(clock.clone())),
            clock,
            sink: Arc::new(RecordingErrorSink::new()),
        }
    }

    pub fn agent(&self, agent_id: &str, visibility: Visibility) -> TestAgent {
        self.agent_with(agent_id, visibility, |_| {})
    }

    /// An agent whose session id and lease holder id are both `agent_id`.
    pub fn agent_with(
        &self,
        agent_id: &str,
        visibility: Visibility,
        configure: impl FnOnce(&mut PresenceConfig),
    ) -> TestAgent {
        self.build_agent(agent_id, visibility, self.docs.clone(), configure)
    }

    /// An agent whose writes each take `delay` to reach the document store.
    pub fn slow_agent(
        &self,
        agent_id: &str,
        visibility: Visibility,
        delay: Duration,
        configure: impl FnOnce(&mut PresenceConfig),
    ) -> TestAgent {
        let docs = Arc::new(SlowDocuments {
            inner: self.docs.clone(),
            delay,
        });
        self.build_agent(agent_id, visibility, docs, configure)
    }

    fn build_agent(
        &self,
        agent_id: &str,
        visibility: Visibility,
        docs: Arc<dyn DocumentStore>,
        configure: impl FnOnce(&mut PresenceConfig),
    ) -> TestAgent {
        let mut config = PresenceConfig::default();
        configure(&mut config);

        let handle = self.store.agent(agent_id);
        let (platform, bridge) = Platform::channel(visibility, Network::Online);
        let signals = EnvironmentSignals::spawn(Some(platform), handle.change_feed());
        let election = LeaderElection::new(
            Arc::new(handle),
            self.clock.clone(),
            signals.storage_changes(),
            agent_id.to_string(),
            config.lease_ttl,
            config.renew_interval,
        );
        let writer = PresenceWriter::new(docs, agent_id.to_string(), self.sink.clone());
        TestAgent {
            coordinator: PresenceCoordinator::new(election, writer, signals, config, self.sink.clone()),
            platform: bridge,
        }
    }

    /// States written to `path`, in order, including failed attempts.
    pub async fn states(&self, path: &str) -> Vec<PresenceState> {
        self.docs
            .attempts(path)
            .await
            .iter()
            .filter_map(|w| w.state())
            .collect()
    }

    pub async fn heartbeats(&self, path: &str) -> usize {
        self.docs
            .attempts(path)
            .await
            .iter()
            .filter(|w| w.is_heartbeat())
            .count()
    }

    pub fn lease(&self, identity_id: &str) -> Option<Lease> {
        self.store
            .peek(&leader_lease_key(identity_id))
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    /// Overwrite the lease as `agent_id`, the way a racing agent would.
    pub fn seize_lease(&self, agent_id: &str, identity_id: &str) {
        let lease = Lease::new(
            identity_id,
            agent_id,
            self.clock.now() + chrono::TimeDelta::seconds(15),
        );
        self.store
            .agent(agent_id)
            .set(
                &leader_lease_key(identity_id),
                &serde_json::to_string(&lease).unwrap(),
            )
            .unwrap();
    }
}

/// Document store whose writes stall for `delay` before landing.
struct SlowDocuments {
    inner: Arc<MemoryDocumentStore>,
    delay: Duration,
}

#[async_trait::async_trait]
impl DocumentStore for SlowDocuments {
    async fn update(&self, path: &str, patch: &Patch) -> Result<(), DocumentError> {
        tokio::time::sleep(self.delay).await;
        self.inner.update(path, patch).await
    }

    async fn create_with_merge(&self, path: &str, seed: &Patch) -> Result<(), DocumentError> {
        tokio::time::sleep(self.delay).await;
        self.inner.create_with_merge(path, seed).await
    }
}
