use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A time-bounded claim on the right to write one identity's presence.
/// Stored as JSON under `presence_leader:<identity-id>` in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Identity whose presence record this lease guards
    pub identity_id: String,
    /// The agent holding this lease (random per agent lifetime)
    pub agent_id: String,
    /// Absolute time after which the lease is void
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(identity_id: &str, agent_id: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            identity_id: identity_id.to_string(),
            agent_id: agent_id.to_string(),
            expires_at,
        }
    }

    /// Check if this lease has expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True if `agent_id` holds this lease and it has not expired.
    pub fn is_held_by(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        self.agent_id == agent_id && !self.is_expired(now)
    }
}
