//! A small fixed-size pool of proxy-owned backend connections, sized to
//! the batcher's expected concurrent fan-in. Connections are dialed
//! lazily and returned after use; a broken connection is simply dropped
//! and its capacity freed.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::errors::Error;

/// Dials one backend connection.
pub trait Dialer: Send + Sync + 'static {
    type Conn: Send + 'static;

    fn dial(&self) -> impl std::future::Future<Output = Result<Self::Conn, Error>> + Send;
}

pub struct BackendPool<D: Dialer> {
    dialer: D,
    idle: Mutex<Vec<D::Conn>>,
    permits: Arc<Semaphore>,
}

impl<D: Dialer> BackendPool<D> {
    pub fn new(dialer: D, size: usize) -> BackendPool<D> {
        BackendPool {
            dialer,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Take a connection, dialing a new one when no idle connection is
    /// available. The permit must be held for as long as the connection
    /// is in use and dropped afterwards.
    pub async fn get(&self) -> Result<(D::Conn, OwnedSemaphorePermit), Error> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ShuttingDown)?;

        let idle = self.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            // Dial failure releases the permit with it.
            None => self.dialer.dial().await?,
        };

        Ok((conn, permit))
    }

    /// Return a healthy connection for reuse. Broken connections are
    /// not returned; dropping them is enough.
    pub fn put(&self, conn: D::Conn) {
        self.idle.lock().push(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDialer {
        dials: Arc<AtomicUsize>,
    }

    impl Dialer for CountingDialer {
        type Conn = usize;

        async fn dial(&self) -> Result<usize, Error> {
            Ok(self.dials.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = BackendPool::new(
            CountingDialer {
                dials: dials.clone(),
            },
            4,
        );

        let (conn, permit) = pool.get().await.unwrap();
        pool.put(conn);
        drop(permit);

        let (conn, permit) = pool.get().await.unwrap();
        pool.put(conn);
        drop(permit);

        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capacity_bounds_concurrency() {
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(BackendPool::new(
            CountingDialer {
                dials: dials.clone(),
            },
            1,
        ));

        let (conn, permit) = pool.get().await.unwrap();

        // Capacity one: a second get must wait until the first permit
        // is released.
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let (conn, permit) = pool.get().await.unwrap();
                pool.put(conn);
                drop(permit);
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        pool.put(conn);
        drop(permit);
        waiter.await.unwrap();

        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broken_connection_is_replaced() {
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = BackendPool::new(
            CountingDialer {
                dials: dials.clone(),
            },
            2,
        );

        let (_broken, permit) = pool.get().await.unwrap();
        // Dropped instead of put back.
        drop(permit);

        let (conn, permit) = pool.get().await.unwrap();
        pool.put(conn);
        drop(permit);

        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }
}
