//! Tests for the write batcher, driven by a mock executor.

use super::*;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Single(BatchItem),
    Batch(Vec<BatchItem>),
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<Call>>,
    fail: AtomicBool,
    hang: AtomicBool,
    next_insert_id: AtomicU64,
}

#[derive(Clone, Default)]
struct MockExecutor {
    state: Arc<MockState>,
}

impl MockExecutor {
    fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().clone()
    }

    fn outcome(&self) -> WriteOutcome {
        WriteOutcome {
            affected_rows: 1,
            last_insert_id: self.state.next_insert_id.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    async fn maybe_misbehave(&self) -> Result<(), Error> {
        if self.state.hang.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.state.fail.load(Ordering::SeqCst) {
            return Err(Error::BackendQuery {
                code: "40001".into(),
                message: "deadlock".into(),
            });
        }
        Ok(())
    }
}

impl BatchExecutor for MockExecutor {
    async fn execute_single(&self, item: &BatchItem) -> Result<WriteOutcome, Error> {
        self.maybe_misbehave().await?;
        self.state.calls.lock().push(Call::Single(item.clone()));
        Ok(self.outcome())
    }

    async fn execute_batch(&self, items: &[BatchItem]) -> Result<Vec<WriteOutcome>, Error> {
        self.maybe_misbehave().await?;
        self.state.calls.lock().push(Call::Batch(items.to_vec()));
        Ok(items.iter().map(|_| self.outcome()).collect())
    }
}

fn batcher(max_batch_size: usize) -> (WriteBatcher<MockExecutor>, MockExecutor) {
    let executor = MockExecutor::default();
    let batcher = WriteBatcher::new(
        executor.clone(),
        max_batch_size,
        Duration::from_secs(30),
    );
    (batcher, executor)
}

fn item(i: usize) -> BatchItem {
    BatchItem {
        query: "INSERT INTO t(v) VALUES (?)".into(),
        params: Bytes::from(format!("param-{i}")),
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_writes_coalesce_into_one_batch() {
    let (batcher, executor) = batcher(1_000);
    let key = "INSERT INTO t(v) VALUES (?)";

    let enqueues = (0..10).map(|i| batcher.enqueue(key, item(i), 50, None));
    let results = futures::future::join_all(enqueues).await;

    // Exactly one backend transaction for the whole window.
    let calls = executor.calls();
    assert_eq!(calls.len(), 1);
    let Call::Batch(items) = &calls[0] else {
        panic!("expected a batched call, got {calls:?}");
    };
    assert_eq!(items.len(), 10);

    // Execution order equals enqueue order.
    let expected: Vec<BatchItem> = (0..10).map(item).collect();
    assert_eq!(items, &expected);

    for (i, result) in results.into_iter().enumerate() {
        let result = result.unwrap();
        assert_eq!(result.affected_rows, 1);
        assert_eq!(result.batch_size, 10);
        // Monotonically increasing insert ids across the batch, one per
        // request, in order.
        assert_eq!(result.last_insert_id, i as u64 + 1);
    }

    assert_eq!(batcher.batches_executed(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lone_request_flushes_as_plain_write() {
    let (batcher, executor) = batcher(1_000);

    let result = batcher
        .enqueue("k", item(0), 5, None)
        .await
        .unwrap();

    assert_eq!(result.batch_size, 1);
    assert_eq!(executor.calls(), vec![Call::Single(item(0))]);
}

#[tokio::test(start_paused = true)]
async fn test_zero_batch_ms_executes_immediately() {
    let (batcher, executor) = batcher(1_000);

    let result = batcher
        .enqueue("k", item(0), 0, None)
        .await
        .unwrap();

    assert_eq!(result.batch_size, 1);
    assert_eq!(result.affected_rows, 1);
    assert_eq!(executor.calls(), vec![Call::Single(item(0))]);
}

#[tokio::test(start_paused = true)]
async fn test_size_cap_splits_flushes() {
    let (batcher, executor) = batcher(3);
    let key = "k";

    let enqueues = (0..5).map(|i| batcher.enqueue(key, item(i), 1_000, None));
    let results = futures::future::join_all(enqueues).await;

    for result in results {
        assert!(result.is_ok());
    }

    let calls = executor.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], Call::Batch((0..3).map(item).collect()));
    assert_eq!(calls[1], Call::Batch((3..5).map(item).collect()));
    assert_eq!(batcher.batches_executed(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_distinct_keys_never_coalesce() {
    let (batcher, executor) = batcher(1_000);

    let a = batcher.enqueue("key-a", item(0), 10, None);
    let b = batcher.enqueue("key-b", item(1), 10, None);
    let (a, b) = futures::future::join(a, b).await;

    assert_eq!(a.unwrap().batch_size, 1);
    assert_eq!(b.unwrap().batch_size, 1);
    assert_eq!(executor.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_after_close_fails_fast() {
    let (batcher, executor) = batcher(1_000);

    batcher.close();
    assert!(batcher.is_closed());

    let err = batcher.enqueue("k", item(0), 10, None).await.unwrap_err();
    assert_eq!(err, Error::BatcherClosed);
    assert!(executor.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_flush_failure_fans_out_identical_errors() {
    let (batcher, executor) = batcher(1_000);
    executor.state.fail.store(true, Ordering::SeqCst);

    let enqueues = (0..4).map(|i| batcher.enqueue("k", item(i), 10, None));
    let results = futures::future::join_all(enqueues).await;

    for result in results {
        assert_eq!(
            result.unwrap_err(),
            Error::BackendQuery {
                code: "40001".into(),
                message: "deadlock".into(),
            }
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_timeout() {
    let executor = MockExecutor::default();
    executor.state.hang.store(true, Ordering::SeqCst);
    let batcher = WriteBatcher::new(executor.clone(), 1_000, Duration::from_secs(30));

    let err = batcher.enqueue("k", item(0), 10, None).await.unwrap_err();
    assert_eq!(err, Error::BatcherTimeout);
}

#[tokio::test(start_paused = true)]
async fn test_on_complete_receives_final_size() {
    let (batcher, _) = batcher(1_000);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let enqueues = (0..3).map(|i| {
        let seen = seen.clone();
        batcher.enqueue(
            "k",
            item(i),
            10,
            Some(Box::new(move |size| seen.lock().push(size)) as OnComplete),
        )
    });
    let results = futures::future::join_all(enqueues).await;

    for result in results {
        assert_eq!(result.unwrap().batch_size, 3);
    }
    assert_eq!(*seen.lock(), vec![3usize, 3, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_new_group_forms_after_flush() {
    let (batcher, executor) = batcher(1_000);

    let first = batcher.enqueue("k", item(0), 5, None).await.unwrap();
    let second = batcher.enqueue("k", item(1), 5, None).await.unwrap();

    assert_eq!(first.batch_size, 1);
    assert_eq!(second.batch_size, 1);
    assert_eq!(executor.calls().len(), 2);
}
