//! Write batcher configuration.

use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Batch {
    #[serde(default = "Batch::default_enabled")]
    pub enabled: bool,

    /// Hard cap on requests coalesced into one backend transaction.
    #[serde(default = "Batch::default_max_batch_size")]
    pub max_batch_size: usize,

    /// Milliseconds an enqueue waits for its flush before giving up.
    #[serde(default = "Batch::default_enqueue_timeout")]
    pub enqueue_timeout: u64,
}

impl Batch {
    pub fn default_enabled() -> bool {
        true
    }

    pub fn default_max_batch_size() -> usize {
        1_000
    }

    pub fn default_enqueue_timeout() -> u64 {
        30_000
    }
}

impl Default for Batch {
    fn default() -> Batch {
        Batch {
            enabled: Self::default_enabled(),
            max_batch_size: Self::default_max_batch_size(),
            enqueue_timeout: Self::default_enqueue_timeout(),
        }
    }
}
