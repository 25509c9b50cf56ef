use pkg_signals::{EnvironmentSignals, Network, Visibility};
use pkg_state::leader::{LeaderElection, LeadershipSignal};
use pkg_types::config::PresenceConfig;
use pkg_types::presence::PresenceState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::document::Patch;
use crate::sink::{ErrorContext, ErrorSink};
use crate::writer::{PresenceWrite, PresenceWriter};

/// Where a coordinator session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Uninitialized,
    Bootstrapping,
    LeadingVisible,
    LeadingHidden,
    Following,
}

impl CoordinatorState {
    pub fn is_leading(&self) -> bool {
        matches!(
            self,
            CoordinatorState::LeadingVisible | CoordinatorState::LeadingHidden
        )
    }
}

/// Drives one agent's presence: follows leadership and environment signals,
/// keeps the heartbeat, and decides which writes to issue.
#[derive(Clone)]
pub struct PresenceCoordinator {
    election: LeaderElection,
    writer: PresenceWriter,
    signals: EnvironmentSignals,
    config: PresenceConfig,
    sink: Arc<dyn ErrorSink>,
}

impl PresenceCoordinator {
    pub fn new(
        election: LeaderElection,
        writer: PresenceWriter,
        signals: EnvironmentSignals,
        config: PresenceConfig,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            election,
            writer,
            signals,
            config,
            sink,
        }
    }

    pub fn agent_id(&self) -> &str {
        self.election.agent_id()
    }

    pub fn signals(&self) -> &EnvironmentSignals {
        &self.signals
    }

    pub fn sink(&self) -> Arc<dyn ErrorSink> {
        self.sink.clone()
    }

    /// Begin a session for `identity_id`. The session runs until
    /// [`CoordinatorSession::stop`] or until the handle is dropped.
    pub fn start(&self, identity_id: &str) -> CoordinatorSession {
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Uninitialized);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let writer = tokio::spawn(drain_writes(
            self.writer.clone(),
            identity_id.to_string(),
            write_rx,
        ));

        let leadership = self.election.leadership_signal(identity_id);
        let machine = Machine {
            identity_id: identity_id.to_string(),
            election: self.election.clone(),
            leadership: leadership.subscribe(),
            _leadership: leadership,
            visibility: self.signals.visibility(),
            network: self.signals.network(),
            writes: write_tx.clone(),
            state: state_tx,
            heartbeat: None,
            heartbeat_period: self.config.heartbeat_interval,
        };
        let machine = tokio::spawn(machine.run(stop_rx));

        CoordinatorSession {
            exit: ExitHandle {
                identity_id: identity_id.to_string(),
                election: self.election.clone(),
                state: state_rx.clone(),
                writes: write_tx.downgrade(),
                mark_offline_on_exit: self.config.mark_offline_on_exit,
            },
            identity_id: identity_id.to_string(),
            election: self.election.clone(),
            sink: self.sink.clone(),
            state: state_rx,
            writes: Some(write_tx),
            stop: Some(stop_tx),
            machine: Some(machine),
            writer: Some(writer),
            stop_timeout: self.config.stop_timeout,
        }
    }
}

/// Teardown side of a session that can be held apart from it, so exit
/// handling never waits on whoever owns the session.
#[derive(Clone)]
pub struct ExitHandle {
    identity_id: String,
    election: LeaderElection,
    state: watch::Receiver<CoordinatorState>,
    writes: mpsc::WeakUnboundedSender<PresenceWrite>,
    mark_offline_on_exit: bool,
}

impl ExitHandle {
    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    /// The agent is being torn down. Releases the lease right away so
    /// another agent can take over without waiting out the TTL. An offline
    /// write is only attempted when `mark_offline_on_exit` is set, since a
    /// closing agent cannot tell whether others of the identity remain.
    pub fn before_exit(&self) {
        let leading = self.state.borrow().is_leading();
        self.election.release_leadership(&self.identity_id);
        let offline = leading && self.mark_offline_on_exit;
        if offline {
            if let Some(writes) = self.writes.upgrade() {
                let _ = writes.send(PresenceWrite::State(PresenceState::Offline));
            }
        }
        debug!(
            "Presence session for {} handled exit (leading={}, offline_write={})",
            self.identity_id, leading, offline
        );
    }
}

/// Handle on a running coordinator session. Dropping it cancels the
/// session's timers and subscriptions without a final write.
pub struct CoordinatorSession {
    identity_id: String,
    election: LeaderElection,
    sink: Arc<dyn ErrorSink>,
    state: watch::Receiver<CoordinatorState>,
    writes: Option<mpsc::UnboundedSender<PresenceWrite>>,
    stop: Option<oneshot::Sender<()>>,
    machine: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    exit: ExitHandle,
    stop_timeout: Duration,
}

impl CoordinatorSession {
    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    pub fn state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.clone()
    }

    pub fn is_leading(&self) -> bool {
        self.state.borrow().is_leading()
    }

    /// Queue display fields behind any pending state writes. Only the
    /// leader writes; returns whether the patch was queued.
    pub fn write_public_patch(&self, patch: Patch) -> bool {
        if !self.is_leading() {
            return false;
        }
        self.writes
            .as_ref()
            .is_some_and(|writes| writes.send(PresenceWrite::PublicPatch(patch)).is_ok())
    }

    pub fn exit_handle(&self) -> ExitHandle {
        self.exit.clone()
    }

    /// See [`ExitHandle::before_exit`].
    pub fn before_exit(&self) {
        self.exit.before_exit();
    }

    /// End the session. If leading, one offline write is issued; this waits
    /// for it to settle (bounded by the stop timeout), then releases the
    /// lease. Writes still queued when the timeout lapses are dropped, and
    /// none follow.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(machine) = self.machine.take() {
            if let Err(e) = machine.await {
                if !e.is_cancelled() {
                    self.sink.report(
                        &anyhow::Error::new(e),
                        &ErrorContext::loud("coordinator", Some(&self.identity_id)),
                    );
                }
            }
        }

        drop(self.writes.take());
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(self.stop_timeout, &mut writer)
                .await
                .is_err()
            {
                writer.abort();
                warn!(
                    "Final presence write for {} did not settle within {}ms",
                    self.identity_id,
                    self.stop_timeout.as_millis()
                );
            }
        }

        self.election.release_leadership(&self.identity_id);
        info!("Presence session for {} stopped", self.identity_id);
    }
}

impl Drop for CoordinatorSession {
    fn drop(&mut self) {
        if let Some(machine) = self.machine.take() {
            machine.abort();
        }
    }
}

async fn drain_writes(
    writer: PresenceWriter,
    identity_id: String,
    mut writes: mpsc::UnboundedReceiver<PresenceWrite>,
) {
    while let Some(write) = writes.recv().await {
        let outcome = writer.write(&identity_id, &write).await;
        debug!("Presence write {:?} for {}: {:?}", write, identity_id, outcome);
    }
}

struct Machine {
    identity_id: String,
    election: LeaderElection,
    leadership: watch::Receiver<Option<bool>>,
    _leadership: LeadershipSignal,
    visibility: watch::Receiver<Visibility>,
    network: watch::Receiver<Network>,
    writes: mpsc::UnboundedSender<PresenceWrite>,
    state: watch::Sender<CoordinatorState>,
    heartbeat: Option<Interval>,
    heartbeat_period: Duration,
}

impl Machine {
    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        self.set_state(CoordinatorState::Bootstrapping);

        let first = tokio::select! {
            _ = &mut stop => None,
            leading = first_evaluation(&mut self.leadership) => Some(leading),
        };
        let Some(first) = first else {
            self.set_state(CoordinatorState::Uninitialized);
            return;
        };
        self.visibility.borrow_and_update();
        self.network.borrow_and_update();
        if first {
            self.lead();
        } else {
            self.follow();
        }

        loop {
            tokio::select! {
                _ = &mut stop => {
                    if self.is_leading() {
                        self.enqueue(PresenceWrite::State(PresenceState::Offline));
                    }
                    self.heartbeat = None;
                    self.set_state(CoordinatorState::Uninitialized);
                    break;
                }
                Ok(()) = self.leadership.changed() => {
                    let leading = *self.leadership.borrow_and_update() == Some(true);
                    self.on_leadership(leading);
                }
                Ok(()) = self.visibility.changed() => {
                    let visibility = *self.visibility.borrow_and_update();
                    self.on_visibility(visibility);
                }
                Ok(()) = self.network.changed() => {
                    let network = *self.network.borrow_and_update();
                    self.on_network(network);
                }
                _ = next_beat(&mut self.heartbeat) => self.on_heartbeat(),
            }
        }
    }

    fn current(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    fn is_leading(&self) -> bool {
        self.current().is_leading()
    }

    fn set_state(&self, next: CoordinatorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(
                "Presence coordinator for {}: {:?} -> {:?}",
                self.identity_id, previous, next
            );
        }
    }

    fn enqueue(&self, write: PresenceWrite) {
        if self.writes.send(write).is_err() {
            debug!("Presence writer for {} has shut down", self.identity_id);
        }
    }

    /// Take over writing: one state write for the current visibility, and a
    /// heartbeat with an immediate first beat when visible.
    fn lead(&mut self) {
        let visibility = *self.visibility.borrow();
        match visibility {
            Visibility::Visible => {
                self.set_state(CoordinatorState::LeadingVisible);
                self.enqueue(PresenceWrite::State(PresenceState::Online));
                self.start_heartbeat(Instant::now());
            }
            Visibility::Hidden => {
                self.set_state(CoordinatorState::LeadingHidden);
                self.enqueue(PresenceWrite::State(PresenceState::Away));
                self.heartbeat = None;
            }
        }
    }

    /// Go silent; whoever leads now owns the record.
    fn follow(&mut self) {
        self.heartbeat = None;
        self.set_state(CoordinatorState::Following);
    }

    fn start_heartbeat(&mut self, first_beat: Instant) {
        let mut interval = tokio::time::interval_at(first_beat, self.heartbeat_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(interval);
    }

    fn on_leadership(&mut self, leading: bool) {
        match (leading, self.is_leading()) {
            (true, false) => self.lead(),
            (false, true) => self.follow(),
            _ => {}
        }
    }

    fn on_visibility(&mut self, visibility: Visibility) {
        match (self.current(), visibility) {
            (CoordinatorState::LeadingVisible, Visibility::Hidden) => {
                self.heartbeat = None;
                self.set_state(CoordinatorState::LeadingHidden);
                self.enqueue(PresenceWrite::State(PresenceState::Away));
            }
            (CoordinatorState::LeadingHidden, Visibility::Visible) => {
                self.set_state(CoordinatorState::LeadingVisible);
                self.enqueue(PresenceWrite::State(PresenceState::Online));
                self.start_heartbeat(Instant::now() + self.heartbeat_period);
            }
            _ => {}
        }
    }

    fn on_network(&mut self, network: Network) {
        if !self.is_leading() {
            return;
        }
        match network {
            Network::Offline => {
                self.enqueue(PresenceWrite::State(PresenceState::Offline));
            }
            Network::Online => {
                // Demotion only ever comes from the leadership signal, which
                // suppresses repeats; a local verdict here could strand us.
                if !self.election.try_acquire_or_renew(&self.identity_id) {
                    debug!(
                        "Lease for {} is held elsewhere after reconnect",
                        self.identity_id
                    );
                    return;
                }
                let state = match *self.visibility.borrow() {
                    Visibility::Visible => PresenceState::Online,
                    Visibility::Hidden => PresenceState::Away,
                };
                self.enqueue(PresenceWrite::State(state));
            }
        }
    }

    fn on_heartbeat(&mut self) {
        if *self.network.borrow() == Network::Offline {
            debug!("Heartbeat for {} skipped while offline", self.identity_id);
            return;
        }
        self.enqueue(PresenceWrite::Heartbeat);
    }
}

async fn first_evaluation(leadership: &mut watch::Receiver<Option<bool>>) -> bool {
    match leadership.wait_for(Option::is_some).await {
        Ok(value) => *value == Some(true),
        Err(_) => false,
    }
}

async fn next_beat(heartbeat: &mut Option<Interval>) -> Instant {
    match heartbeat {
        Some(interval) => interval.tick().await,
        None => std::future::pending().await,
    }
}
