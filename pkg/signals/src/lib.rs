//! Environment signal aggregation.
//!
//! Raw platform events (visibility, connectivity, page teardown, storage
//! notifications) are normalized into typed, deduplicated channels that any
//! number of consumers can subscribe to. Where no platform is attached the
//! channels hold their defaults and never fire.

use pkg_state::watch::{ChangeFeed, StorageChange};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// The agent is about to be torn down; execution may stop at any point.
    BeforeExit,
}

/// Raw events as the host platform reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    VisibilityChange { hidden: bool },
    Online,
    Offline,
    PageHide,
    BeforeUnload,
    /// Page restored from a back/forward cache after `PageHide`.
    PageShow,
    Storage(StorageChange),
}

/// A platform attached to the aggregator: its event feed and the state it
/// was in when attached.
pub struct Platform {
    pub events: broadcast::Receiver<PlatformEvent>,
    pub visibility: Visibility,
    pub network: Network,
}

impl Platform {
    /// Create a platform plus the sender used to feed it events.
    pub fn channel(visibility: Visibility, network: Network) -> (Self, PlatformBridge) {
        let (sender, events) = broadcast::channel(64);
        (
            Self {
                events,
                visibility,
                network,
            },
            PlatformBridge { sender },
        )
    }
}

/// Sending side of a [`Platform`], held by whatever observes the host.
#[derive(Clone)]
pub struct PlatformBridge {
    sender: broadcast::Sender<PlatformEvent>,
}

impl PlatformBridge {
    pub fn emit(&self, event: PlatformEvent) {
        let _ = self.sender.send(event);
    }
}

struct Channels {
    visibility: watch::Sender<Visibility>,
    network: watch::Sender<Network>,
    lifecycle: broadcast::Sender<Lifecycle>,
    storage: ChangeFeed,
}

struct Pumps(Vec<JoinHandle<()>>);

impl Drop for Pumps {
    fn drop(&mut self) {
        for pump in &self.0 {
            pump.abort();
        }
    }
}

/// Typed environment signals for one agent.
#[derive(Clone)]
pub struct EnvironmentSignals {
    channels: Arc<Channels>,
    _pumps: Arc<Pumps>,
}

impl EnvironmentSignals {
    /// Signals for an environment without a platform: visible, online, and
    /// no event ever fires.
    pub fn headless() -> Self {
        Self {
            channels: Arc::new(Channels::new(Visibility::Visible, Network::Online)),
            _pumps: Arc::new(Pumps(Vec::new())),
        }
    }

    /// Attach a platform and, optionally, the shared store's change feed.
    pub fn spawn(platform: Option<Platform>, store_changes: Option<ChangeFeed>) -> Self {
        let (visibility, network) = platform
            .as_ref()
            .map(|p| (p.visibility, p.network))
            .unwrap_or_default();
        let channels = Arc::new(Channels::new(visibility, network));

        let mut pumps = Vec::new();
        if let Some(platform) = platform {
            pumps.push(tokio::spawn(pump_platform(platform.events, channels.clone())));
        }
        if let Some(feed) = store_changes {
            pumps.push(tokio::spawn(pump_storage(feed.subscribe(), channels.clone())));
        }

        Self {
            channels,
            _pumps: Arc::new(Pumps(pumps)),
        }
    }

    /// Page visibility; only distinct values are published.
    pub fn visibility(&self) -> watch::Receiver<Visibility> {
        self.channels.visibility.subscribe()
    }

    /// Connectivity; only distinct values are published.
    pub fn network(&self) -> watch::Receiver<Network> {
        self.channels.network.subscribe()
    }

    /// Teardown notifications. One `BeforeExit` per teardown, however many
    /// raw events announce it.
    pub fn lifecycle(&self) -> broadcast::Receiver<Lifecycle> {
        self.channels.lifecycle.subscribe()
    }

    /// Stream form of [`lifecycle`](Self::lifecycle), yielding once per teardown.
    pub fn before_exit(&self) -> impl Stream<Item = ()> + Send + 'static {
        BroadcastStream::new(self.lifecycle()).filter_map(|event| match event {
            Ok(Lifecycle::BeforeExit) => Some(()),
            Err(_) => None,
        })
    }

    /// Shared-store keys changed by other agents.
    pub fn storage_changes(&self) -> ChangeFeed {
        self.channels.storage.clone()
    }
}

impl Channels {
    fn new(visibility: Visibility, network: Network) -> Self {
        let (lifecycle, _) = broadcast::channel(16);
        Self {
            visibility: watch::Sender::new(visibility),
            network: watch::Sender::new(network),
            lifecycle,
            storage: ChangeFeed::new(),
        }
    }

    fn set_visibility(&self, next: Visibility) {
        self.visibility.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
    }

    fn set_network(&self, next: Network) {
        self.network.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
    }
}

async fn pump_platform(mut events: broadcast::Receiver<PlatformEvent>, channels: Arc<Channels>) {
    let mut exiting = false;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Platform event feed lagged, skipped {}", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            PlatformEvent::VisibilityChange { hidden } => channels.set_visibility(if hidden {
                Visibility::Hidden
            } else {
                Visibility::Visible
            }),
            PlatformEvent::Online => channels.set_network(Network::Online),
            PlatformEvent::Offline => channels.set_network(Network::Offline),
            PlatformEvent::PageHide | PlatformEvent::BeforeUnload => {
                if !exiting {
                    exiting = true;
                    let _ = channels.lifecycle.send(Lifecycle::BeforeExit);
                }
            }
            PlatformEvent::PageShow => exiting = false,
            PlatformEvent::Storage(change) => channels.storage.publish(change),
        }
    }
}

async fn pump_storage(mut changes: broadcast::Receiver<StorageChange>, channels: Arc<Channels>) {
    loop {
        match changes.recv().await {
            Ok(change) => channels.storage.publish(change),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Subscribers re-read on any change; a clear covers what was missed.
                debug!("Storage change feed lagged, skipped {}", skipped);
                channels.storage.publish(StorageChange {
                    key: None,
                    new_value: None,
                });
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
