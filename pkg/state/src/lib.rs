//! Shared lease store, clocks and per-identity leader election.

pub mod client;
pub mod clock;
pub mod leader;
pub mod watch;

pub use client::{MemorySharedStore, MemoryStoreHandle, SharedStore, StoreError};
pub use clock::{Clock, SystemClock, TokioClock};
pub use leader::{LeaderElection, LeadershipSignal};
pub use watch::{ChangeFeed, StorageChange};
