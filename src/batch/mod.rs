//! Hint-directed write batcher.
//!
//! Coalesces concurrent auto-commit writes that share a batch key into
//! one backend transaction. A group opens on the first arrival, which
//! arms a one-shot timer of the statement's `batch` hint; the group
//! flushes when the timer fires or when the size cap is reached,
//! whichever comes first. The flush detaches the request list under the
//! group mutex and executes without holding it, so new arrivals form a
//! fresh group.
//!
//! Each request's result travels over a single-use channel: the batcher
//! is the sole producer and the enqueueing task the sole consumer. A
//! caller that gives up (timeout, cancellation) drops its receiver; the
//! producer's send is allowed to fail.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::errors::Error;
use crate::metrics::{
    BATCHED_WRITES_TOTAL, BATCH_DELAY_SECONDS, BATCH_LATENCY_SECONDS, BATCH_SIZE,
};
use crate::utils::dashmap::new_dashmap;

#[cfg(test)]
mod tests;

/// One write to execute: the statement text and an opaque,
/// dialect-encoded parameter section (empty for plain text statements).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub query: String,
    pub params: Bytes,
}

impl BatchItem {
    pub fn text(query: &str) -> BatchItem {
        BatchItem {
            query: query.to_string(),
            params: Bytes::new(),
        }
    }
}

/// Per-statement outcome reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub affected_rows: u64,
    /// Dialect-specific; 0 when not applicable.
    pub last_insert_id: u64,
}

/// What an enqueued request receives once its group has flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    /// Size of the flushed group this request participated in.
    pub batch_size: usize,
}

/// Executes detached request lists against one backend data source.
///
/// `execute_batch` MUST run all items inside a single transaction and
/// either report one outcome per item, in order, or fail as a whole.
/// Statement reuse across identical texts is the implementor's concern.
pub trait BatchExecutor: Send + Sync + 'static {
    fn execute_single(
        &self,
        item: &BatchItem,
    ) -> impl std::future::Future<Output = Result<WriteOutcome, Error>> + Send;

    fn execute_batch(
        &self,
        items: &[BatchItem],
    ) -> impl std::future::Future<Output = Result<Vec<WriteOutcome>, Error>> + Send;
}

/// Completion callback, invoked with the final group size immediately
/// before result fan-out.
pub type OnComplete = Box<dyn FnOnce(usize) + Send + 'static>;

struct WriteRequest {
    item: BatchItem,
    enqueued_at: Instant,
    result_tx: oneshot::Sender<Result<WriteResult, Error>>,
    on_complete: Option<OnComplete>,
}

struct BatchGroup {
    requests: Vec<WriteRequest>,
    timer: Option<JoinHandle<()>>,
    /// Set once the flush has taken the request list; stragglers that
    /// still hold the group handle must retry with a fresh group.
    detached: bool,
}

impl BatchGroup {
    fn new() -> BatchGroup {
        BatchGroup {
            requests: Vec::new(),
            timer: None,
            detached: false,
        }
    }
}

struct Inner<E: BatchExecutor> {
    executor: E,
    groups: DashMap<String, Arc<Mutex<BatchGroup>>>,
    max_batch_size: usize,
    enqueue_timeout: Duration,
    closed: AtomicBool,
    batches_executed: AtomicU64,
}

/// The write batcher. Cheap to clone; all clones share one group map
/// and one backend data source.
pub struct WriteBatcher<E: BatchExecutor> {
    inner: Arc<Inner<E>>,
}

impl<E: BatchExecutor> Clone for WriteBatcher<E> {
    fn clone(&self) -> Self {
        WriteBatcher {
            inner: self.inner.clone(),
        }
    }
}

impl<E: BatchExecutor> WriteBatcher<E> {
    pub fn new(executor: E, max_batch_size: usize, enqueue_timeout: Duration) -> WriteBatcher<E> {
        WriteBatcher {
            inner: Arc::new(Inner {
                executor,
                groups: new_dashmap(num_cpus::get()),
                max_batch_size,
                enqueue_timeout,
                closed: AtomicBool::new(false),
                batches_executed: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(executor: E, config: &crate::config::Batch) -> WriteBatcher<E> {
        WriteBatcher::new(
            executor,
            config.max_batch_size,
            Duration::from_millis(config.enqueue_timeout),
        )
    }

    /// Enqueue one write and block until the group containing it
    /// flushes and this request's slot is filled.
    ///
    /// `batch_ms == 0` executes immediately as a singleton: no group,
    /// no timer, indistinguishable from a direct write.
    pub async fn enqueue(
        &self,
        batch_key: &str,
        item: BatchItem,
        batch_ms: u64,
        on_complete: Option<OnComplete>,
    ) -> Result<WriteResult, Error> {
        let inner = &self.inner;

        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::BatcherClosed);
        }

        if batch_ms == 0 {
            let outcome = inner.executor.execute_single(&item).await?;
            if let Some(callback) = on_complete {
                callback(1);
            }
            return Ok(WriteResult {
                affected_rows: outcome.affected_rows,
                last_insert_id: outcome.last_insert_id,
                batch_size: 1,
            });
        }

        let (result_tx, result_rx) = oneshot::channel();
        let request = WriteRequest {
            item,
            enqueued_at: Instant::now(),
            result_tx,
            on_complete,
        };

        Inner::insert_request(inner, batch_key, request, batch_ms);

        match tokio::time::timeout(inner.enqueue_timeout, result_rx).await {
            // The group's eventual completion fills an abandoned slot
            // harmlessly.
            Err(_) => Err(Error::BatcherTimeout),
            Ok(Err(_)) => Err(Error::BatcherClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// Mark the batcher closed. In-flight groups complete normally; no
    /// new timers are started; any enqueue after close fails fast.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        debug!("write batcher closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Batches executed through this batcher instance, reported by the
    /// status surface as `writebatch.batches.total`.
    pub fn batches_executed(&self) -> u64 {
        self.inner.batches_executed.load(Ordering::Relaxed)
    }
}

impl<E: BatchExecutor> Inner<E> {
    /// Append a request to its group, creating the group and arming its
    /// flush timer on first arrival, and flushing inline when the size
    /// cap is reached.
    fn insert_request(inner: &Arc<Inner<E>>, batch_key: &str, request: WriteRequest, batch_ms: u64) {
        loop {
            let group_arc = {
                let entry = inner
                    .groups
                    .entry(batch_key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(BatchGroup::new())));
                entry.value().clone()
                // The map guard drops here; the group mutex is never
                // taken while a shard lock is held.
            };

            let mut group = group_arc.lock();
            if group.detached {
                // Lost the race against a flush; that group is already
                // out of the map.
                continue;
            }

            group.requests.push(request);
            let size = group.requests.len();

            if size >= inner.max_batch_size {
                // Cap reached: this flush happens now, the timer is
                // dead weight.
                if let Some(timer) = group.timer.take() {
                    timer.abort();
                }
                let requests = Self::detach_locked(inner, batch_key, &mut group);
                drop(group);

                let inner = inner.clone();
                tokio::spawn(async move {
                    Inner::execute_list(&inner, requests).await;
                });
            } else if size == 1 {
                let inner_weak = Arc::downgrade(inner);
                let group_weak = Arc::downgrade(&group_arc);
                let key = batch_key.to_string();
                group.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(batch_ms)).await;
                    if let (Some(inner), Some(group)) = (inner_weak.upgrade(), group_weak.upgrade())
                    {
                        Inner::flush_group(&inner, &key, &group).await;
                    }
                }));
            }

            return;
        }
    }

    /// Timer-driven flush. A no-op when a cap flush got there first.
    async fn flush_group(inner: &Arc<Inner<E>>, batch_key: &str, group_arc: &Arc<Mutex<BatchGroup>>) {
        let requests = {
            let mut group = group_arc.lock();
            if group.detached {
                return;
            }
            group.timer = None;
            Self::detach_locked(inner, batch_key, &mut group)
        };

        if !requests.is_empty() {
            Self::execute_list(inner, requests).await;
        }
    }

    /// Take the request list and drop the group out of the key map.
    /// Callers hold the group mutex; the map entry is removed before it
    /// is released so a new arrival can only find a fresh group.
    fn detach_locked(
        inner: &Arc<Inner<E>>,
        batch_key: &str,
        group: &mut BatchGroup,
    ) -> Vec<WriteRequest> {
        group.detached = true;
        inner.groups.remove(batch_key);
        std::mem::take(&mut group.requests)
    }

    /// Execute a detached list: one plain write for a singleton, one
    /// transaction for a group. Results fan out in enqueue order after
    /// the commit; a failure is delivered identically to every request.
    async fn execute_list(inner: &Arc<Inner<E>>, requests: Vec<WriteRequest>) {
        let size = requests.len();
        let flush_started = Instant::now();
        for request in &requests {
            BATCH_DELAY_SECONDS
                .observe(flush_started.duration_since(request.enqueued_at).as_secs_f64());
        }

        let outcome = if size == 1 {
            inner
                .executor
                .execute_single(&requests[0].item)
                .await
                .map(|outcome| vec![outcome])
        } else {
            let items: Vec<BatchItem> = requests.iter().map(|r| r.item.clone()).collect();
            inner.executor.execute_batch(&items).await
        };

        BATCH_LATENCY_SECONDS.observe(flush_started.elapsed().as_secs_f64());

        match outcome {
            Ok(outcomes) => {
                if outcomes.len() != size {
                    warn!(
                        "batch executor returned {} outcomes for {} requests",
                        outcomes.len(),
                        size
                    );
                    let error = Error::ProtocolSyncError(
                        "batch executor returned a short outcome list".into(),
                    );
                    for request in requests {
                        let _ = request.result_tx.send(Err(error.clone()));
                    }
                    return;
                }

                inner.batches_executed.fetch_add(1, Ordering::Relaxed);
                BATCH_SIZE.observe(size as f64);
                BATCHED_WRITES_TOTAL.inc_by(size as u64);

                let mut completions = Vec::with_capacity(size);
                let mut deliveries = Vec::with_capacity(size);
                for (request, outcome) in requests.into_iter().zip(outcomes) {
                    if let Some(callback) = request.on_complete {
                        completions.push(callback);
                    }
                    deliveries.push((request.result_tx, outcome));
                }
                for callback in completions {
                    callback(size);
                }
                for (result_tx, outcome) in deliveries {
                    let _ = result_tx.send(Ok(WriteResult {
                        affected_rows: outcome.affected_rows,
                        last_insert_id: outcome.last_insert_id,
                        batch_size: size,
                    }));
                }
            }
            Err(error) => {
                debug!("batch flush of {size} requests failed: {error}");
                for request in requests {
                    let _ = request.result_tx.send(Err(error.clone()));
                }
            }
        }
    }
}
