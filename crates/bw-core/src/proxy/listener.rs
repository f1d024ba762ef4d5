//! Bridge Listener
//!
//! Turns connections pushed by the tunnel transport into a pull-style
//! `accept()` so ordinary stream servers can consume them.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::envelope::ConnectionEnvelope;
use crate::error::{BurrowError, Result};

/// Default number of connections that may wait for `accept()`
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// What `put_conn` does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Fail immediately with `QueueFull`
    #[default]
    Reject,
    /// Producers may call `put_conn_wait` to wait for a free slot
    Wait,
}

struct Queue {
    items: VecDeque<ConnectionEnvelope>,
    closed: bool,
}

/// Bounded multi-producer, single-consumer connection queue with close
/// semantics.
///
/// The closed flag and the queue share one lock: a connection is either
/// queued before `close()` and dropped by it, or refused.
pub struct BridgeListener {
    queue: Mutex<Queue>,
    /// Signalled when a connection is queued
    available: Notify,
    /// Signalled when a slot frees up
    space: Notify,
    closed: CancellationToken,
    capacity: usize,
    policy: BackpressurePolicy,
}

impl BridgeListener {
    /// Create a listener holding at most `capacity` pending connections
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        let capacity = capacity.max(1);

        Self {
            queue: Mutex::new(Queue {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Notify::new(),
            space: Notify::new(),
            closed: CancellationToken::new(),
            capacity,
            policy,
        }
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured backpressure policy
    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Number of connections waiting for `accept()`
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Inject a ready connection without blocking.
    pub fn put_conn(&self, conn: ConnectionEnvelope) -> Result<()> {
        let mut queue = self.lock();
        if queue.closed {
            return Err(BurrowError::QueueClosed);
        }
        if queue.items.len() >= self.capacity {
            return Err(BurrowError::QueueFull {
                capacity: self.capacity,
            });
        }
        queue.items.push_back(conn);
        drop(queue);

        self.available.notify_one();
        Ok(())
    }

    /// Inject a connection, waiting for a free slot when the policy allows.
    ///
    /// With `BackpressurePolicy::Reject` this behaves like `put_conn`.
    pub async fn put_conn_wait(&self, conn: ConnectionEnvelope) -> Result<()> {
        if self.policy == BackpressurePolicy::Reject {
            return self.put_conn(conn);
        }

        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut queue = self.lock();
                if queue.closed {
                    return Err(BurrowError::QueueClosed);
                }
                if queue.items.len() < self.capacity {
                    queue.items.push_back(conn);
                    drop(queue);
                    self.available.notify_one();
                    return Ok(());
                }
            }

            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(BurrowError::QueueClosed),
                _ = space => {}
            }
        }
    }

    /// Wait for the next pushed connection.
    ///
    /// Returns `ListenerClosed` once `close()` has been called.
    pub async fn accept(&self) -> Result<ConnectionEnvelope> {
        loop {
            let available = self.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            {
                let mut queue = self.lock();
                if queue.closed {
                    return Err(BurrowError::ListenerClosed);
                }
                if let Some(conn) = queue.items.pop_front() {
                    drop(queue);
                    self.space.notify_one();
                    return Ok(conn);
                }
            }

            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(BurrowError::ListenerClosed),
                _ = available => {}
            }
        }
    }

    /// Close the listener and drop every queued connection, which closes
    /// the tunnel stream it carries. Idempotent.
    pub fn close(&self) {
        let pending = {
            let mut queue = self.lock();
            if queue.closed {
                return;
            }
            queue.closed = true;
            std::mem::take(&mut queue.items)
        };

        self.closed.cancel();
        self.available.notify_waiters();
        self.space.notify_waiters();
        debug!("Closing bridge listener ({} pending dropped)", pending.len());
        drop(pending);
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BridgeListener {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, BackpressurePolicy::default())
    }
}

impl std::fmt::Debug for BridgeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeListener")
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::envelope::ExtraInfo;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    fn conn(port: u16) -> ConnectionEnvelope {
        let (a, _b) = tokio::io::duplex(16);
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ConnectionEnvelope::new(a, None, &ExtraInfo::new().with_src_addr(addr))
    }

    #[tokio::test]
    async fn test_accept_is_fifo() {
        let listener = BridgeListener::new(16, BackpressurePolicy::Reject);
        for port in 1..=10 {
            listener.put_conn(conn(port)).unwrap();
        }
        assert_eq!(listener.len(), 10);

        for port in 1..=10 {
            let accepted = listener.accept().await.unwrap();
            assert_eq!(accepted.remote_addr().unwrap().port(), port);
        }
        assert!(listener.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let listener = BridgeListener::new(2, BackpressurePolicy::Reject);
        listener.put_conn(conn(1)).unwrap();
        listener.put_conn(conn(2)).unwrap();

        let err = listener.put_conn(conn(3)).unwrap_err();
        assert!(matches!(err, BurrowError::QueueFull { capacity: 2 }));

        listener.accept().await.unwrap();
        listener.put_conn(conn(3)).unwrap();
    }

    #[tokio::test]
    async fn test_close_wakes_accept() {
        let listener = Arc::new(BridgeListener::default());

        let waiter = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.close();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("accept did not wake up")
            .unwrap();
        assert!(matches!(result, Err(BurrowError::ListenerClosed)));

        assert!(matches!(listener.put_conn(conn(1)), Err(BurrowError::QueueClosed)));
    }

    #[tokio::test]
    async fn test_accept_after_close_never_blocks() {
        let listener = BridgeListener::default();
        listener.put_conn(conn(1)).unwrap();
        listener.close();
        listener.close();

        for _ in 0..3 {
            let result = tokio::time::timeout(Duration::from_millis(100), listener.accept())
                .await
                .expect("accept blocked after close");
            assert!(matches!(result, Err(BurrowError::ListenerClosed)));
        }
    }

    #[tokio::test]
    async fn test_close_drops_queued_connections() {
        use tokio::io::AsyncReadExt;

        let listener = BridgeListener::default();
        let (tunnel_side, mut peer) = tokio::io::duplex(16);
        listener
            .put_conn(ConnectionEnvelope::new(tunnel_side, None, &ExtraInfo::new()))
            .unwrap();
        assert_eq!(listener.len(), 1);

        listener.close();
        assert!(listener.is_empty());

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(1), peer.read(&mut buf))
            .await
            .expect("queued connection stayed open after close");
        assert_eq!(read.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wait_policy_blocks_until_drained() {
        let listener = Arc::new(BridgeListener::new(1, BackpressurePolicy::Wait));
        listener.put_conn(conn(1)).unwrap();

        let producer = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.put_conn_wait(conn(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(listener.accept().await.unwrap().remote_addr().unwrap().port(), 1);
        producer.await.unwrap().unwrap();
        assert_eq!(listener.accept().await.unwrap().remote_addr().unwrap().port(), 2);
    }

    #[tokio::test]
    async fn test_waiting_producer_released_on_close() {
        let listener = Arc::new(BridgeListener::new(1, BackpressurePolicy::Wait));
        listener.put_conn(conn(1)).unwrap();

        let producer = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.put_conn_wait(conn(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.close();

        let result = producer.await.unwrap();
        assert!(matches!(result, Err(BurrowError::QueueClosed)));
    }

    #[tokio::test]
    async fn test_many_producers() {
        let listener = Arc::new(BridgeListener::new(128, BackpressurePolicy::Reject));
        let mut producers = Vec::new();
        for port in 0..100u16 {
            let listener = Arc::clone(&listener);
            producers.push(tokio::spawn(async move { listener.put_conn(conn(port)) }));
        }
        for producer in producers {
            producer.await.unwrap().unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..100 {
            seen.push(listener.accept().await.unwrap().remote_addr().unwrap().port());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }
}
