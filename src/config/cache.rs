//! Query cache configuration.

use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Cache {
    /// Entry count ceiling; recency-based reclamation beyond it.
    #[serde(default = "Cache::default_max_entries")]
    pub max_entries: usize,

    /// Grace window added to every entry's TTL, during which stale
    /// bytes may be served while one caller refreshes.
    #[serde(default = "Cache::default_grace_seconds")]
    pub grace_seconds: u64,

    /// Ceiling on how long a reader waits for a peer's in-flight fetch.
    #[serde(default = "Cache::default_wait_timeout")]
    pub wait_timeout: u64,
}

impl Cache {
    pub fn default_max_entries() -> usize {
        16_384
    }

    pub fn default_grace_seconds() -> u64 {
        10
    }

    /// Milliseconds.
    pub fn default_wait_timeout() -> u64 {
        30_000
    }
}

impl Default for Cache {
    fn default() -> Cache {
        Cache {
            max_entries: Self::default_max_entries(),
            grace_seconds: Self::default_grace_seconds(),
            wait_timeout: Self::default_wait_timeout(),
        }
    }
}
