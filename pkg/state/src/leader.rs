use chrono::TimeDelta;
use pkg_constants::state::{LEADER_LEASE_TTL_SECS, MAX_LEADER_LEASE_TTL_SECS, leader_lease_key};
use pkg_types::lease::Lease;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tracing::{debug, info, warn};

use crate::client::SharedStore;
use crate::clock::Clock;
use crate::watch::ChangeFeed;

/// Per-identity leader election over the shared store.
///
/// Every agent of an identity runs one of these. At most one agent should
/// believe it holds a live lease at a time, but reads and writes are not
/// atomic: two agents can both see an absent lease and both write it. The
/// next renewal tick settles on whichever write the store kept.
#[derive(Clone)]
pub struct LeaderElection {
    inner: Arc<ElectionInner>,
}

struct ElectionInner {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    changes: ChangeFeed,
    agent_id: String,
    ttl: TimeDelta,
    renew_interval: Duration,
    signals: Mutex<HashMap<String, Weak<SignalTask>>>,
}

#[derive(Clone, Copy, Debug)]
enum Trigger {
    Renew,
    Changed,
    Released,
}

impl LeaderElection {
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        changes: ChangeFeed,
        agent_id: String,
        lease_ttl: Duration,
        renew_interval: Duration,
    ) -> Self {
        let max_ttl = TimeDelta::seconds(MAX_LEADER_LEASE_TTL_SECS as i64);
        let ttl = TimeDelta::from_std(lease_ttl)
            .ok()
            .filter(|ttl| *ttl > TimeDelta::zero() && *ttl <= max_ttl)
            .unwrap_or_else(|| {
                warn!(
                    "Lease TTL {:?} out of range, using {}s",
                    lease_ttl, LEADER_LEASE_TTL_SECS
                );
                TimeDelta::seconds(LEADER_LEASE_TTL_SECS as i64)
            });
        let ttl_std = ttl
            .to_std()
            .unwrap_or(Duration::from_secs(LEADER_LEASE_TTL_SECS));
        // Renewal has to land before the lease lapses.
        let renew_interval = if renew_interval.is_zero() || renew_interval >= ttl_std {
            ttl_std / 3
        } else {
            renew_interval
        };
        Self {
            inner: Arc::new(ElectionInner {
                store,
                clock,
                changes,
                agent_id,
                ttl,
                renew_interval,
                signals: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// This agent's lease holder id.
    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    /// Try to acquire or renew the lease. Returns true if we are the leader.
    ///
    /// Fails open: if the store cannot be read or written, this agent
    /// assumes leadership rather than leaving presence unwritten.
    pub fn try_acquire_or_renew(&self, identity_id: &str) -> bool {
        let key = leader_lease_key(identity_id);
        let now = self.inner.clock.now();

        let current = match self.inner.store.get(&key) {
            Ok(raw) => raw.and_then(|raw| parse_lease(&key, &raw)),
            Err(e) => {
                debug!("Lease store unavailable for {}, assuming leader: {}", key, e);
                return true;
            }
        };

        match &current {
            Some(lease) if lease.agent_id == self.inner.agent_id => {}
            Some(lease) if !lease.is_expired(now) => return false,
            Some(lease) => info!(
                "Lease for {} expired (held by {}), acquiring for {}",
                identity_id, lease.agent_id, self.inner.agent_id
            ),
            None => debug!(
                "No existing lease for {}, acquiring for {}",
                identity_id, self.inner.agent_id
            ),
        }

        let lease = Lease::new(identity_id, &self.inner.agent_id, now + self.inner.ttl);
        let data = match serde_json::to_string(&lease) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode lease for {}: {}", identity_id, e);
                return true;
            }
        };
        if let Err(e) = self.inner.store.set(&key, &data) {
            debug!("Lease write failed for {}, assuming leader: {}", key, e);
        }
        true
    }

    /// Pure read: true iff a live lease for `identity_id` is held by this agent.
    /// Returns true when the store is unavailable.
    pub fn is_leader_now(&self, identity_id: &str) -> bool {
        let key = leader_lease_key(identity_id);
        match self.inner.store.get(&key) {
            Ok(Some(raw)) => parse_lease(&key, &raw)
                .is_some_and(|lease| lease.is_held_by(&self.inner.agent_id, self.inner.clock.now())),
            Ok(None) => false,
            Err(e) => {
                debug!("Lease store unavailable for {}, assuming leader: {}", key, e);
                true
            }
        }
    }

    /// Delete the lease if this agent owns it. Synchronous and best-effort,
    /// so it can run while the process is being torn down.
    pub fn release_leadership(&self, identity_id: &str) {
        let key = leader_lease_key(identity_id);
        let owned = match self.inner.store.get(&key) {
            Ok(Some(raw)) => {
                parse_lease(&key, &raw).is_some_and(|lease| lease.agent_id == self.inner.agent_id)
            }
            Ok(None) => false,
            Err(e) => {
                debug!("Cannot release lease {}: {}", key, e);
                false
            }
        };
        if !owned {
            return;
        }
        match self.inner.store.delete(&key) {
            Ok(()) => info!(
                "Released presence leadership for {} ({})",
                identity_id, self.inner.agent_id
            ),
            Err(e) => debug!("Lease release failed for {}: {}", key, e),
        }
    }

    /// Observe leadership of `identity_id`.
    ///
    /// The value is `None` until the first evaluation, then re-evaluated on
    /// every renewal tick and whenever another agent touches the lease key.
    /// Consecutive identical values are suppressed. Calls for the same
    /// identity share one background task while any handle is alive.
    pub fn leadership_signal(&self, identity_id: &str) -> LeadershipSignal {
        let mut signals = self
            .inner
            .signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(shared) = signals.get(identity_id).and_then(Weak::upgrade) {
            return LeadershipSignal { shared };
        }
        signals.retain(|_, task| task.strong_count() > 0);

        let (tx, rx) = watch::channel(None);
        let handle = tokio::spawn(self.clone().run_signal(identity_id.to_string(), tx));
        let shared = Arc::new(SignalTask { rx, handle });
        signals.insert(identity_id.to_string(), Arc::downgrade(&shared));
        LeadershipSignal { shared }
    }

    async fn run_signal(self, identity_id: String, tx: watch::Sender<Option<bool>>) {
        let key = leader_lease_key(&identity_id);
        info!(
            "Leadership signal started for {} (agent={}, ttl={}s, renew={}s)",
            identity_id,
            self.inner.agent_id,
            self.inner.ttl.num_seconds(),
            self.inner.renew_interval.as_secs()
        );

        let ticks = IntervalStream::new(tokio::time::interval(self.inner.renew_interval))
            .map(|_| Trigger::Renew);
        let changes = BroadcastStream::new(self.inner.changes.subscribe()).filter_map(
            move |change| match change {
                Ok(change) if !change.affects(&key) => None,
                Ok(change) if change.is_delete() => Some(Trigger::Released),
                // Ours to re-check; a lagged receiver may have missed the key.
                _ => Some(Trigger::Changed),
            },
        );
        let mut triggers = ticks.merge(changes);

        while let Some(trigger) = triggers.next().await {
            let leading = match trigger {
                Trigger::Renew | Trigger::Released => self.try_acquire_or_renew(&identity_id),
                Trigger::Changed => self.is_leader_now(&identity_id),
            };
            tx.send_if_modified(|current| {
                if *current == Some(leading) {
                    return false;
                }
                if leading {
                    info!(
                        "Agent {} is now the presence LEADER for {}",
                        self.inner.agent_id, identity_id
                    );
                } else if current.is_some() {
                    warn!(
                        "Presence leadership LOST for {} ({}), another agent took over",
                        identity_id, self.inner.agent_id
                    );
                }
                *current = Some(leading);
                true
            });
        }
    }
}

fn parse_lease(key: &str, raw: &str) -> Option<Lease> {
    match serde_json::from_str(raw) {
        Ok(lease) => Some(lease),
        Err(e) => {
            debug!("Ignoring unreadable lease at {}: {}", key, e);
            None
        }
    }
}

struct SignalTask {
    rx: watch::Receiver<Option<bool>>,
    handle: JoinHandle<()>,
}

impl Drop for SignalTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Shared handle on one identity's leadership evaluation loop.
/// The loop stops when the last handle is dropped.
#[derive(Clone)]
pub struct LeadershipSignal {
    shared: Arc<SignalTask>,
}

impl LeadershipSignal {
    /// A new receiver; `None` until the first evaluation completes.
    pub fn subscribe(&self) -> watch::Receiver<Option<bool>> {
        self.shared.rx.clone()
    }

    pub fn current(&self) -> Option<bool> {
        *self.shared.rx.borrow()
    }
}
