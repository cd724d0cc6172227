//! Single-flight TTL query cache with a stale-while-refresh window.
//!
//! Keys are arbitrary bytes (stripped query text, or a digest for
//! prepared statements); values are opaque pre-serialized response
//! buffers the front-end replays verbatim. Each entry is Fresh for its
//! TTL, then Stale for a fixed grace window during which exactly one
//! caller is elected to refresh it while peers keep reading old bytes.
//!
//! The inflight marker is the critical section boundary: no lock is
//! held across a backend fetch, and at most one fetch per key runs at a
//! time.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::utils::dashmap::new_dashmap;

#[cfg(test)]
mod tests;

/// How a `get` hit relates to the entry's TTL window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFlag {
    /// Within TTL.
    Fresh,
    /// Past TTL, within grace, another refresh is already in flight.
    Stale,
    /// Past TTL, within grace, and the caller has been elected to
    /// refresh: it must fetch synchronously and then `set_and_notify`
    /// (or `cancel_inflight` on failure).
    Refresh,
}

struct CacheEntry {
    bytes: Bytes,
    fresh_until: Instant,
    stale_until: Instant,
}

enum InflightSlot {
    Pending,
    Delivered(Bytes),
    Cancelled,
}

/// Rendezvous for everyone waiting on the first requester's fetch.
/// The delivered bytes are stored in the slot before the wakeup, so a
/// waiter never observes a notify without a resolution.
struct Inflight {
    notify: Notify,
    slot: Mutex<InflightSlot>,
    created_at: Instant,
}

impl Inflight {
    fn new() -> Arc<Inflight> {
        Arc::new(Inflight {
            notify: Notify::new(),
            slot: Mutex::new(InflightSlot::Pending),
            created_at: Instant::now(),
        })
    }

    fn resolve(&self, outcome: InflightSlot) {
        *self.slot.lock() = outcome;
        self.notify.notify_waiters();
    }
}

pub struct QueryCache {
    entries: Mutex<LruCache<Bytes, CacheEntry>>,
    inflight: DashMap<Bytes, Arc<Inflight>>,
    grace: Duration,
    wait_timeout: Duration,
}

impl QueryCache {
    pub fn new(max_entries: usize, grace: Duration, wait_timeout: Duration) -> QueryCache {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap();
        QueryCache {
            entries: Mutex::new(LruCache::new(capacity)),
            inflight: new_dashmap(num_cpus::get()),
            grace,
            wait_timeout,
        }
    }

    pub fn from_config(config: &crate::config::Cache) -> QueryCache {
        QueryCache::new(
            config.max_entries,
            Duration::from_secs(config.grace_seconds),
            Duration::from_millis(config.wait_timeout),
        )
    }

    /// Look up a key. `None` means absent (or expired beyond grace);
    /// the caller should continue with [`QueryCache::get_or_wait`].
    pub fn get(&self, key: &[u8]) -> Option<(Bytes, CacheFlag)> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let entry = entries.get(key)?;
        if now < entry.fresh_until {
            return Some((entry.bytes.clone(), CacheFlag::Fresh));
        }
        if now < entry.stale_until {
            let bytes = entry.bytes.clone();
            drop(entries);
            // Past TTL but within grace: elect a refresher if nobody
            // holds the inflight marker yet.
            let flag = match self.inflight.entry(Bytes::copy_from_slice(key)) {
                Entry::Vacant(vacant) => {
                    vacant.insert(Inflight::new());
                    CacheFlag::Refresh
                }
                Entry::Occupied(mut occupied) => {
                    if occupied.get().created_at.elapsed() > self.wait_timeout {
                        // The previous refresher went missing. Take over.
                        occupied.get().resolve(InflightSlot::Cancelled);
                        occupied.insert(Inflight::new());
                        CacheFlag::Refresh
                    } else {
                        CacheFlag::Stale
                    }
                }
            };
            return Some((bytes, flag));
        }

        // Beyond grace: the entry is dead.
        entries.pop(key);
        None
    }

    /// Single-flight primitive for cold keys. Returns `(bytes, waited)`:
    /// `(None, false)` elects the caller to fetch and then call
    /// [`QueryCache::set_and_notify`] or [`QueryCache::cancel_inflight`];
    /// `(Some(_), _)` delivers a peer's result; `(None, true)` means the
    /// peer's fetch failed or timed out and the caller should fetch for
    /// itself.
    pub async fn get_or_wait(&self, key: &[u8]) -> (Option<Bytes>, bool) {
        // The key may have been populated since the caller's miss.
        {
            let now = Instant::now();
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get(key) {
                if now < entry.stale_until {
                    return (Some(entry.bytes.clone()), false);
                }
                entries.pop(key);
            }
        }

        let inflight = match self.inflight.entry(Bytes::copy_from_slice(key)) {
            Entry::Vacant(vacant) => {
                vacant.insert(Inflight::new());
                return (None, false);
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().created_at.elapsed() > self.wait_timeout {
                    occupied.get().resolve(InflightSlot::Cancelled);
                    occupied.insert(Inflight::new());
                    return (None, false);
                }
                occupied.get().clone()
            }
        };

        let deadline = Instant::now() + self.wait_timeout;
        loop {
            let notified = inflight.notify.notified();
            match &*inflight.slot.lock() {
                InflightSlot::Delivered(bytes) => return (Some(bytes.clone()), true),
                InflightSlot::Cancelled => return (None, true),
                InflightSlot::Pending => {}
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return (None, true);
            }
        }
    }

    /// Store a value as Fresh.
    pub fn set(&self, key: &[u8], bytes: Bytes, ttl: Duration) {
        let now = Instant::now();
        let entry = CacheEntry {
            bytes,
            fresh_until: now + ttl,
            stale_until: now + ttl + self.grace,
        };
        self.entries.lock().put(Bytes::copy_from_slice(key), entry);
    }

    /// Store a value as Fresh and wake every waiter on the key's
    /// inflight marker, delivering the same bytes.
    pub fn set_and_notify(&self, key: &[u8], bytes: Bytes, ttl: Duration) {
        self.set(key, bytes.clone(), ttl);
        if let Some((_, inflight)) = self.inflight.remove(key) {
            inflight.resolve(InflightSlot::Delivered(bytes));
        }
    }

    /// Remove the inflight marker without touching any prior data and
    /// wake every waiter with "not found" so they can retry themselves.
    pub fn cancel_inflight(&self, key: &[u8]) {
        if let Some((_, inflight)) = self.inflight.remove(key) {
            inflight.resolve(InflightSlot::Cancelled);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}
