//! Presence document / heartbeat constants.

/// Collection holding one presence document per identity.
pub const PRESENCE_COLLECTION: &str = "presence";

/// Interval between heartbeats while leading and visible, in seconds.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Longest heartbeat interval accepted from configuration, in seconds.
pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 3_600;

/// Upper bound on how long `stop()` waits for the final offline write, in milliseconds.
pub const STOP_TIMEOUT_MS: u64 = 3_000;

/// Longest stop timeout accepted from configuration, in milliseconds.
pub const MAX_STOP_TIMEOUT_MS: u64 = 60_000;

/// Writing `offline` from a closing agent is off unless configured.
pub const MARK_OFFLINE_ON_EXIT: bool = false;

/// Longest identity id accepted by the engine.
pub const MAX_IDENTITY_ID_LEN: usize = 128;

/// Build the document path for an identity's presence record.
pub fn presence_doc_path(identity_id: &str) -> String {
    format!("{}/{}", PRESENCE_COLLECTION, identity_id)
}
