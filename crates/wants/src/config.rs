//! Want replication configuration

use serde::{Deserialize, Serialize};

/// Largest blob a peer session will fetch (5 MiB)
pub const DEFAULT_MAX_FETCH_SIZE: u64 = 5 * 1024 * 1024;

/// `[wants]` section of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WantConfig {
    /// Fetches that stream more than this many bytes are abandoned
    pub max_fetch_size: u64,

    /// Relay peer requests for missing blobs to other peers while the
    /// relayed hop count stays within this bound. 0 disables relaying.
    pub relay_hops: u32,
}

impl Default for WantConfig {
    fn default() -> Self {
        Self {
            max_fetch_size: DEFAULT_MAX_FETCH_SIZE,
            relay_hops: 0,
        }
    }
}

impl WantConfig {
    /// Whether a request that would be forwarded at `distance` should be relayed
    pub(crate) fn should_relay(&self, distance: i64) -> bool {
        match distance.checked_neg() {
            Some(hops) => hops > 0 && hops <= i64::from(self.relay_hops),
            None => false,
        }
    }
}
