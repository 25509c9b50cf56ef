//! Presence engine: writes one presence record per identity from whichever
//! agent currently holds that identity's lease.

pub mod auth;
pub mod coordinator;
pub mod document;
pub mod orchestrator;
pub mod sink;
pub mod writer;

#[cfg(test)]
mod testing;

pub use auth::{AuthSource, ManualAuth};
pub use coordinator::{CoordinatorSession, CoordinatorState, ExitHandle, PresenceCoordinator};
pub use document::{DocumentError, DocumentStore, FieldValue, MemoryDocumentStore, Patch};
pub use orchestrator::{AuthBinding, PresenceOrchestrator};
pub use sink::{ErrorContext, ErrorSink, RecordingErrorSink, TracingErrorSink};
pub use writer::{PresenceWrite, PresenceWriter, WriteOutcome};
