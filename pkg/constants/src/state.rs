//! Lease store / leader election constants.

/// Shared-store key prefix for the per-identity leader lease.
/// The full key is `presence_leader:<identity-id>`.
pub const LEADER_LEASE_KEY_PREFIX: &str = "presence_leader:";

/// How long a leader lease is valid, in seconds.
pub const LEADER_LEASE_TTL_SECS: u64 = 15;

/// Longest lease TTL accepted from configuration, in seconds.
pub const MAX_LEADER_LEASE_TTL_SECS: u64 = 3_600;

/// The lease is renewed every `TTL / LEADER_RENEW_INTERVAL_DIVISOR` seconds.
pub const LEADER_RENEW_INTERVAL_DIVISOR: u64 = 3;

/// Build the lease key for an identity.
pub fn leader_lease_key(identity_id: &str) -> String {
    format!("{}{}", LEADER_LEASE_KEY_PREFIX, identity_id)
}
