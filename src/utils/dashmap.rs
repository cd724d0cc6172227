use dashmap::DashMap;
use std::hash::Hash;

/// Creates a new DashMap with shard count based on worker_threads.
/// This avoids overhead from incorrect CPU detection in k8s pods.
pub fn new_dashmap<K, V>(worker_threads: usize) -> DashMap<K, V>
where
    K: Eq + Hash,
{
    DashMap::with_shard_amount(optimal_shard_count(worker_threads))
}

/// Calculates optimal shard count based on worker_threads.
/// Uses power of 2 for better hash distribution.
fn optimal_shard_count(worker_threads: usize) -> usize {
    let target = (worker_threads * 4).max(4);
    target.next_power_of_two()
}
