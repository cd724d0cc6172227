//! Per-connection status surface.
//!
//! Answers the synthetic status query (`SHOW TQDB STATUS`,
//! `SELECT * FROM pg_tqdb_status()`) from state the connection task
//! itself maintains; no other connection's activity is visible here.
//! The one monotonic row, `writebatch.batches.total`, is read off the
//! batcher serving the connection's pool and handed in by the caller.

/// Labels for the backend that served the last statement.
pub const BACKEND_NONE: &str = "none";
pub const BACKEND_CACHE: &str = "cache";
pub const BACKEND_CACHE_STALE: &str = "cache (stale)";
pub const BACKEND_WRITE_BATCH: &str = "write-batch";

/// What the connection observed about its most recent statement.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub last_backend: String,
    pub last_shard: String,
    pub last_batch_size: usize,
}

impl ConnectionStatus {
    pub fn new(shard: &str) -> ConnectionStatus {
        ConnectionStatus {
            last_backend: BACKEND_NONE.to_string(),
            last_shard: shard.to_string(),
            last_batch_size: 0,
        }
    }

    pub fn backend(&mut self, label: &str) {
        self.last_backend = label.to_string();
    }

    pub fn batched(&mut self, batch_size: usize) {
        self.last_backend = BACKEND_WRITE_BATCH.to_string();
        self.last_batch_size = batch_size;
    }

    pub fn shard(&mut self, name: &str) {
        self.last_shard = name.to_string();
    }

    /// The `(Variable_name, Value)` rows of the status result set.
    /// `LastBatchSize` is only emitted once a batch completed on this
    /// connection; `batches_total` is the owning batcher's counter.
    pub fn rows(&self, batches_total: u64) -> Vec<(String, String)> {
        let mut rows = vec![
            ("Backend".to_string(), self.last_backend.clone()),
            ("Shard".to_string(), self.last_shard.clone()),
        ];
        if self.last_batch_size > 0 {
            rows.push((
                "LastBatchSize".to_string(),
                self.last_batch_size.to_string(),
            ));
        }
        rows.push((
            "writebatch.batches.total".to_string(),
            batches_total.to_string(),
        ));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_rows_omit_batch_size() {
        let status = ConnectionStatus::new("main");
        let rows = status.rows(0);

        assert_eq!(rows[0], ("Backend".into(), "none".into()));
        assert_eq!(rows[1], ("Shard".into(), "main".into()));
        assert!(!rows.iter().any(|(name, _)| name == "LastBatchSize"));
        assert_eq!(
            rows.last().unwrap(),
            &("writebatch.batches.total".to_string(), "0".to_string())
        );
    }

    #[test]
    fn test_batched_statement_updates_backend_and_size() {
        let mut status = ConnectionStatus::new("main");
        status.batched(10);

        let rows = status.rows(3);
        assert_eq!(rows[0].1, BACKEND_WRITE_BATCH);
        assert!(rows.contains(&("LastBatchSize".into(), "10".into())));
        assert!(rows.contains(&("writebatch.batches.total".into(), "3".into())));
    }

    #[test]
    fn test_cache_labels() {
        let mut status = ConnectionStatus::new("main");
        status.backend(BACKEND_CACHE);
        assert_eq!(status.rows(0)[0].1, "cache");

        status.backend(BACKEND_CACHE_STALE);
        assert_eq!(status.rows(0)[0].1, "cache (stale)");
    }
}
