use serde::{Deserialize, Serialize};

/// Externally visible availability of an identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Away,
    Offline,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::Online => "online",
            PresenceState::Away => "away",
            PresenceState::Offline => "offline",
        }
    }
}

impl std::fmt::Display for PresenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field names of the presence document at `presence/<identity-id>`.
///
/// Readers outside the engine (and access policies on the store) depend on
/// these names, so they are fixed here rather than derived from a struct.
pub mod fields {
    pub const IDENTITY_ID: &str = "identityId";
    pub const SESSION_ID: &str = "sessionId";
    pub const STATE: &str = "state";
    pub const LAST_SEEN_AT: &str = "lastSeenAt";
    pub const LAST_STATE_CHANGE_AT: &str = "lastStateChangeAt";
    pub const UPDATED_AT: &str = "updatedAt";

    /// Fields that must exist the moment a record is created.
    pub const SEED_REQUIRED: &[&str] = &[
        IDENTITY_ID,
        SESSION_ID,
        STATE,
        LAST_SEEN_AT,
        LAST_STATE_CHANGE_AT,
        UPDATED_AT,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(PresenceState::Away).unwrap(),
            serde_json::json!("away")
        );
        let parsed: PresenceState = serde_json::from_str("\"offline\"").unwrap();
        assert_eq!(parsed, PresenceState::Offline);
    }
}
