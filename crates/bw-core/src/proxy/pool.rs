//! Shared buffer pool
//!
//! A fixed number of fixed-size copy buffers shared by every session of one
//! owner. A session holds a lease for its lifetime, which caps the memory
//! spent on copying at `slots * buffer_size`. Buffers are allocated on first
//! use and go back to the pool when the lease drops.

use bytes::BytesMut;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::error::{BurrowError, Result};

/// Default buffer size (32 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Smallest buffer handed out; also the floor of the HTTP layer
pub const MIN_BUFFER_SIZE: usize = 8 * 1024;

/// Bounded pool of reusable buffers
#[derive(Debug, Clone)]
pub struct BufferPool {
    buffer_size: usize,
    slots: usize,
    semaphore: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<BytesMut>>>,
}

/// A buffer taken from a [`BufferPool`]; returned on drop
#[derive(Debug)]
pub struct BufferLease {
    buffer: BytesMut,
    idle: Arc<Mutex<Vec<BytesMut>>>,
    _permit: OwnedSemaphorePermit,
}

impl BufferLease {
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..]
    }

    /// The buffer cut in two, one half per copy direction
    pub fn halves(&mut self) -> (&mut [u8], &mut [u8]) {
        let mid = self.buffer.len() / 2;
        self.buffer.split_at_mut(mid)
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buffer);
    }
}

impl BufferPool {
    pub fn new(slots: usize, buffer_size: usize) -> Self {
        let slots = slots.max(1);
        Self {
            buffer_size: buffer_size.max(MIN_BUFFER_SIZE),
            slots,
            semaphore: Arc::new(Semaphore::new(slots)),
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Leases currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Buffers allocated and waiting for reuse
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Take a buffer, waiting for one to free up if the pool is exhausted
    pub async fn acquire(&self) -> Result<BufferLease> {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Buffer pool exhausted ({}/{}), waiting for a free buffer",
                    self.slots, self.slots
                );
                Arc::clone(&self.semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|e| BurrowError::ProxyError(format!("Buffer pool closed: {}", e)))?
            }
        };

        let recycled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let buffer = recycled.unwrap_or_else(|| BytesMut::zeroed(self.buffer_size));

        Ok(BufferLease {
            buffer,
            idle: Arc::clone(&self.idle),
            _permit: permit,
        })
    }

    /// Stop handing out buffers; pending `acquire` calls fail
    pub fn close(&self) {
        self.semaphore.close();
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(256, DEFAULT_BUFFER_SIZE)
    }
}
