use pkg_signals::{EnvironmentSignals, Platform};
use pkg_state::client::SharedStore;
use pkg_state::clock::Clock;
use pkg_state::leader::LeaderElection;
use pkg_types::config::PresenceConfig;
use pkg_types::validate::validate_identity_id;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::auth::AuthSource;
use crate::coordinator::{CoordinatorSession, CoordinatorState, ExitHandle, PresenceCoordinator};
use crate::document::DocumentStore;
use crate::sink::{ErrorContext, ErrorSink};
use crate::writer::PresenceWriter;

/// Entry point for the rest of the application.
///
/// Runs at most one coordinator session at a time, for the current identity.
/// Nothing here returns an error: presence is an enhancement, so failures
/// are reported to the error sink and otherwise ignored.
pub struct PresenceOrchestrator {
    coordinator: PresenceCoordinator,
    sink: Arc<dyn ErrorSink>,
    active: Arc<AsyncMutex<Option<CoordinatorSession>>>,
    /// Teardown handle of the newest session. Kept outside `active` so the
    /// exit hook never queues behind a stop in progress.
    exiting: Arc<Mutex<Option<ExitHandle>>>,
    exit_hook_installed: AtomicBool,
    exit_hook: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceOrchestrator {
    pub fn new(coordinator: PresenceCoordinator) -> Self {
        Self {
            sink: coordinator.sink(),
            coordinator,
            active: Arc::new(AsyncMutex::new(None)),
            exiting: Arc::new(Mutex::new(None)),
            exit_hook_installed: AtomicBool::new(false),
            exit_hook: Mutex::new(None),
        }
    }

    /// Wire up one agent under a fresh random agent id.
    pub fn assemble(
        config: PresenceConfig,
        store: Arc<dyn SharedStore>,
        docs: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        platform: Option<Platform>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        let agent_id = uuid::Uuid::new_v4().to_string();
        let signals = EnvironmentSignals::spawn(platform, store.change_feed());
        let election = LeaderElection::new(
            store,
            clock,
            signals.storage_changes(),
            agent_id.clone(),
            config.lease_ttl,
            config.renew_interval,
        );
        let writer = PresenceWriter::new(docs, agent_id.clone(), sink.clone());
        info!("Presence agent {} assembled", agent_id);
        Self::new(PresenceCoordinator::new(
            election, writer, signals, config, sink,
        ))
    }

    pub fn agent_id(&self) -> &str {
        self.coordinator.agent_id()
    }

    /// Run presence for `identity_id`. A no-op if a session for it is
    /// already running; a session for another identity is stopped first.
    pub async fn start(&self, identity_id: &str) {
        if let Err(e) = validate_identity_id(identity_id) {
            self.sink
                .report(&e, &ErrorContext::loud("start", Some(identity_id)));
            return;
        }
        self.install_exit_hook();

        let mut active = self.active.lock().await;
        if let Some(session) = active.as_ref() {
            if session.identity_id() == identity_id {
                debug!("Presence already running for {}", identity_id);
                return;
            }
        }
        if let Some(previous) = active.take() {
            info!(
                "Presence identity changed from {} to {}",
                previous.identity_id(),
                identity_id
            );
            previous.stop().await;
        }
        let session = self.coordinator.start(identity_id);
        self.set_exit_handle(Some(session.exit_handle()));
        *active = Some(session);
    }

    /// Stop the running session, if any.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        if let Some(session) = active.take() {
            session.stop().await;
            self.set_exit_handle(None);
        }
    }

    pub async fn current_identity(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|session| session.identity_id().to_string())
    }

    pub async fn session_state(&self) -> Option<watch::Receiver<CoordinatorState>> {
        self.active.lock().await.as_ref().map(CoordinatorSession::state)
    }

    /// Follow an auth source: start once auth is ready and an identity is
    /// present, switch on identity change, stop on sign-out. The binding
    /// ends when the returned handle is dropped.
    pub fn bind(self: &Arc<Self>, auth: &dyn AuthSource) -> AuthBinding {
        let ready = auth.auth_ready();
        let identity = auth.identity();
        let this = self.clone();
        AuthBinding {
            handle: tokio::spawn(async move { this.follow_auth(ready, identity).await }),
        }
    }

    async fn follow_auth(
        &self,
        mut ready: watch::Receiver<bool>,
        mut identity: watch::Receiver<Option<String>>,
    ) {
        loop {
            let target = if *ready.borrow_and_update() {
                identity.borrow_and_update().clone()
            } else {
                None
            };
            match target {
                Some(identity_id) => self.start(&identity_id).await,
                None => self.stop().await,
            }

            let open = tokio::select! {
                changed = ready.changed() => changed.is_ok(),
                changed = identity.changed() => changed.is_ok(),
            };
            if !open {
                debug!("Auth source closed, presence binding ends");
                break;
            }
        }
    }

    fn install_exit_hook(&self) {
        if self.exit_hook_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut exits = Box::pin(self.coordinator.signals().before_exit());
        let exiting = self.exiting.clone();
        let hook = tokio::spawn(async move {
            while exits.next().await.is_some() {
                let handle = exiting
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(handle) = handle {
                    info!("Agent exiting, handing off presence for {}", handle.identity_id());
                    handle.before_exit();
                }
            }
        });
        *self
            .exit_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    fn set_exit_handle(&self, handle: Option<ExitHandle>) {
        *self
            .exiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handle;
    }
}

impl Drop for PresenceOrchestrator {
    fn drop(&mut self) {
        if let Some(hook) = self
            .exit_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            hook.abort();
        }
    }
}

/// Keeps a [`PresenceOrchestrator::bind`] loop alive.
pub struct AuthBinding {
    handle: JoinHandle<()>,
}

impl Drop for AuthBinding {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ManualAuth;
    use crate::document::MemoryDocumentStore;
    use crate::sink::RecordingErrorSink;
    use crate::testing::Harness;
    use pkg_signals::{Network, PlatformEvent, Visibility};
    use pkg_state::client::MemorySharedStore;
    use pkg_state::clock::TokioClock;
    use pkg_types::presence::PresenceState;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let h = Harness::new();
        let agent = h.agent("a", Visibility::Visible);
        let orchestrator = PresenceOrchestrator::new(agent.coordinator);

        orchestrator.start("u1").await;
        settle().await;
        let first = orchestrator.session_state().await.unwrap();
        orchestrator.start("u1").await;
        orchestrator.start("u1").await;
        settle().await;

        let again = orchestrator.session_state().await.unwrap();
        assert!(first.same_channel(&again));
        assert_eq!(h.states("presence/u1").await, vec![PresenceState::Online]);
    }

    #[tokio::test(start_paused = true)]
    async fn identity_change_stops_previous_session_first() {
        let h = Harness::new();
        let agent = h.agent("a", Visibility::Visible);
        let orchestrator = PresenceOrchestrator::new(agent.coordinator);

        orchestrator.start("u1").await;
        settle().await;
        orchestrator.start("u2").await;
        settle().await;

        assert_eq!(orchestrator.current_identity().await.as_deref(), Some("u2"));
        assert_eq!(
            h.states("presence/u1").await,
            vec![PresenceState::Online, PresenceState::Offline]
        );
        assert!(h.lease("u1").is_none());
        assert_eq!(h.states("presence/u2").await, vec![PresenceState::Online]);

        let writes = h.docs.writes().await;
        let u1_offline = writes
            .iter()
            .position(|w| w.path == "presence/u1" && w.state() == Some(PresenceState::Offline))
            .unwrap();
        let u2_first = writes.iter().position(|w| w.path == "presence/u2").unwrap();
        assert!(u1_offline < u2_first);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_identity_is_reported_not_started() {
        let h = Harness::new();
        let agent = h.agent("a", Visibility::Visible);
        let orchestrator = PresenceOrchestrator::new(agent.coordinator);

        orchestrator.start("a/b").await;
        orchestrator.start("").await;

        assert!(orchestrator.current_identity().await.is_none());
        let reports = h.sink.reports();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|(_, ctx)| !ctx.silent && ctx.operation == "start"));
        assert!(h.docs.writes().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_session_is_a_no_op() {
        let h = Harness::new();
        let agent = h.agent("a", Visibility::Visible);
        let orchestrator = PresenceOrchestrator::new(agent.coordinator);

        orchestrator.stop().await;
        orchestrator.start("u1").await;
        settle().await;
        orchestrator.stop().await;
        orchestrator.stop().await;

        assert!(orchestrator.current_identity().await.is_none());
        assert_eq!(
            h.states("presence/u1").await,
            vec![PresenceState::Online, PresenceState::Offline]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exit_hook_is_installed_once() {
        let h = Harness::new();
        let agent = h.agent_with("a", Visibility::Visible, |cfg| {
            cfg.mark_offline_on_exit = true;
        });
        let orchestrator = PresenceOrchestrator::new(agent.coordinator);

        orchestrator.start("u1").await;
        orchestrator.start("u1").await;
        orchestrator.start("u2").await;
        settle().await;

        agent.platform.emit(PlatformEvent::PageHide);
        agent.platform.emit(PlatformEvent::BeforeUnload);
        settle().await;

        assert!(h.lease("u2").is_none());
        assert_eq!(
            h.states("presence/u2").await,
            vec![PresenceState::Online, PresenceState::Offline]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exit_hands_leadership_to_another_agent() {
        let h = Harness::new();
        let a = h.agent("a", Visibility::Visible);
        let b = h.agent("b", Visibility::Visible);
        let a_orch = PresenceOrchestrator::new(a.coordinator);
        let b_orch = PresenceOrchestrator::new(b.coordinator);

        a_orch.start("u1").await;
        settle().await;
        b_orch.start("u1").await;
        settle().await;

        a.platform.emit(PlatformEvent::BeforeUnload);
        settle().await;

        let b_state = b_orch.session_state().await.unwrap();
        assert_eq!(*b_state.borrow(), CoordinatorState::LeadingVisible);
        assert_eq!(h.lease("u1").unwrap().agent_id, "b");
        assert_eq!(h.docs.get("presence/u1").await.unwrap()["sessionId"], "b");
        assert!(!h.states("presence/u1").await.contains(&PresenceState::Offline));
    }

    #[tokio::test(start_paused = true)]
    async fn exit_during_slow_stop_releases_at_once() {
        let h = Harness::new();
        let agent = h.slow_agent("a", Visibility::Visible, Duration::from_secs(2), |_| {});
        let orchestrator = Arc::new(PresenceOrchestrator::new(agent.coordinator));
        orchestrator.start("u1").await;
        settle().await;
        assert_eq!(h.lease("u1").unwrap().agent_id, "a");

        let stopping = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.stop().await }
        });
        settle().await;
        agent.platform.emit(PlatformEvent::BeforeUnload);
        settle().await;

        assert!(h.lease("u1").is_none());
        assert!(!stopping.is_finished());
        stopping.await.unwrap();
        assert!(orchestrator.current_identity().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn bind_follows_auth() {
        let h = Harness::new();
        let agent = h.agent("a", Visibility::Visible);
        let orchestrator = Arc::new(PresenceOrchestrator::new(agent.coordinator));
        let auth = ManualAuth::new();
        let _binding = orchestrator.bind(&auth);

        auth.sign_in("u1");
        settle().await;
        assert!(orchestrator.current_identity().await.is_none());

        auth.mark_ready();
        settle().await;
        assert_eq!(orchestrator.current_identity().await.as_deref(), Some("u1"));

        auth.sign_in("u2");
        settle().await;
        assert_eq!(orchestrator.current_identity().await.as_deref(), Some("u2"));
        assert!(h.lease("u1").is_none());

        auth.sign_out();
        settle().await;
        assert!(orchestrator.current_identity().await.is_none());
        assert!(h.lease("u2").is_none());
        assert_eq!(
            h.states("presence/u2").await,
            vec![PresenceState::Online, PresenceState::Offline]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn assembled_agent_gets_random_id() {
        let store = MemorySharedStore::new();
        let clock = Arc::new(TokioClock::new());
        let docs = Arc::new(MemoryDocumentStore::new(clock.clone()));
        let sink = Arc::new(RecordingErrorSink::new());
        let (platform, _bridge) = Platform::channel(Visibility::Hidden, Network::Online);

        let orchestrator = PresenceOrchestrator::assemble(
            PresenceConfig::default(),
            Arc::new(store.agent("tab")),
            docs.clone(),
            clock,
            Some(platform),
            sink,
        );
        assert!(uuid::Uuid::parse_str(orchestrator.agent_id()).is_ok());

        orchestrator.start("u1").await;
        settle().await;

        let doc = docs.get("presence/u1").await.unwrap();
        assert_eq!(doc["sessionId"], orchestrator.agent_id());
        assert_eq!(doc["state"], "away");
    }
}
