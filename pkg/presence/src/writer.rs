use pkg_constants::presence::presence_doc_path;
use pkg_types::presence::{PresenceState, fields};
use std::sync::Arc;
use tracing::debug;

use crate::document::{DocumentError, DocumentStore, FieldValue, Patch};
use crate::sink::{ErrorContext, ErrorSink};

/// Result of a presence write. Failures have already been reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The existing record was updated in place.
    Updated,
    /// The record was missing and has been created from a seed.
    Seeded,
    /// The write did not land.
    Failed,
}

/// A queued presence write.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceWrite {
    Heartbeat,
    State(PresenceState),
    PublicPatch(Patch),
}

/// Upserts one identity's presence record, tagged with this agent's session id.
///
/// Timestamps are always the store's own write time. Nothing here returns an
/// error: failures go to the error sink and resolve as [`WriteOutcome::Failed`].
#[derive(Clone)]
pub struct PresenceWriter {
    store: Arc<dyn DocumentStore>,
    session_id: String,
    sink: Arc<dyn ErrorSink>,
}

impl PresenceWriter {
    pub fn new(store: Arc<dyn DocumentStore>, session_id: String, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            store,
            session_id,
            sink,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn write(&self, identity_id: &str, write: &PresenceWrite) -> WriteOutcome {
        match write {
            PresenceWrite::Heartbeat => self.write_heartbeat(identity_id).await,
            PresenceWrite::State(state) => self.write_state(identity_id, *state).await,
            PresenceWrite::PublicPatch(patch) => {
                self.write_public_patch(identity_id, patch.clone()).await
            }
        }
    }

    /// Confirm liveness without changing `state`.
    pub async fn write_heartbeat(&self, identity_id: &str) -> WriteOutcome {
        let mut patch = self.session_patch();
        patch.insert(fields::LAST_SEEN_AT.to_string(), FieldValue::ServerTimestamp);
        self.upsert(identity_id, "heartbeat", patch).await
    }

    pub async fn write_online(&self, identity_id: &str) -> WriteOutcome {
        self.write_state(identity_id, PresenceState::Online).await
    }

    pub async fn write_away(&self, identity_id: &str) -> WriteOutcome {
        self.write_state(identity_id, PresenceState::Away).await
    }

    pub async fn write_offline(&self, identity_id: &str) -> WriteOutcome {
        self.write_state(identity_id, PresenceState::Offline).await
    }

    /// Merge display fields into the record. Engine-owned fields in `patch`
    /// are dropped.
    pub async fn write_public_patch(&self, identity_id: &str, patch: Patch) -> WriteOutcome {
        let mut merged = self.session_patch();
        for (field, value) in patch {
            if fields::SEED_REQUIRED.contains(&field.as_str()) {
                debug!("Dropping reserved field {} from public patch", field);
                continue;
            }
            merged.insert(field, value);
        }
        self.upsert(identity_id, "public_patch", merged).await
    }

    async fn write_state(&self, identity_id: &str, state: PresenceState) -> WriteOutcome {
        let mut patch = self.session_patch();
        patch.insert(fields::STATE.to_string(), state.into());
        patch.insert(fields::LAST_SEEN_AT.to_string(), FieldValue::ServerTimestamp);
        patch.insert(
            fields::LAST_STATE_CHANGE_AT.to_string(),
            FieldValue::ServerTimestamp,
        );
        let operation = match state {
            PresenceState::Online => "write_online",
            PresenceState::Away => "write_away",
            PresenceState::Offline => "write_offline",
        };
        self.upsert(identity_id, operation, patch).await
    }

    fn session_patch(&self) -> Patch {
        let mut patch = Patch::new();
        patch.insert(
            fields::SESSION_ID.to_string(),
            FieldValue::from(self.session_id.as_str()),
        );
        patch.insert(fields::UPDATED_AT.to_string(), FieldValue::ServerTimestamp);
        patch
    }

    /// Everything a freshly created record must carry. Seeding only happens
    /// while a session is writing, so the base state is `online`.
    fn seed(&self, identity_id: &str, patch: Patch) -> Patch {
        let mut seed = self.session_patch();
        seed.insert(fields::IDENTITY_ID.to_string(), FieldValue::from(identity_id));
        seed.insert(fields::STATE.to_string(), PresenceState::Online.into());
        seed.insert(fields::LAST_SEEN_AT.to_string(), FieldValue::ServerTimestamp);
        seed.insert(
            fields::LAST_STATE_CHANGE_AT.to_string(),
            FieldValue::ServerTimestamp,
        );
        seed.extend(patch);
        seed
    }

    async fn upsert(&self, identity_id: &str, operation: &'static str, patch: Patch) -> WriteOutcome {
        let path = presence_doc_path(identity_id);
        match self.store.update(&path, &patch).await {
            Ok(()) => WriteOutcome::Updated,
            Err(DocumentError::NotFound(_)) => {
                debug!("Presence record {} missing, seeding on {}", path, operation);
                let seed = self.seed(identity_id, patch);
                match self.store.create_with_merge(&path, &seed).await {
                    Ok(()) => WriteOutcome::Seeded,
                    Err(e) => self.fail(identity_id, operation, e),
                }
            }
            Err(e) => self.fail(identity_id, operation, e),
        }
    }

    fn fail(&self, identity_id: &str, operation: &'static str, error: DocumentError) -> WriteOutcome {
        self.sink.report(
            &anyhow::Error::new(error),
            &ErrorContext::silent(operation, identity_id),
        );
        WriteOutcome::Failed
    }
}
