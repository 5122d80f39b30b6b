//! Fixed-size packet buffers recycled through a shared free list.
//!
//! A [`Buffer`] is move-only and hands its storage back to the pool when dropped, so a buffer can
//! never be released twice and never outlives its last user:
//!
//! ```compile_fail
//! let pool = tunroute_router::BufferPool::new(1500, 4, 16);
//! let buf = pool.acquire().unwrap();
//! pool.release(buf);
//! pool.release(buf); // use of moved value
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::PoolExhausted;

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buffer_size: usize,
    max_free: usize,
    max_outstanding: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    outstanding: AtomicUsize,
    allocated_total: AtomicU64,
    /// Set while acquisitions are failing; logs once per episode.
    exhausted: AtomicBool,
}

impl PoolInner {
    fn free_list(&self) -> MutexGuard<'_, Vec<Box<[u8]>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, storage: Box<[u8]>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if self.exhausted.load(Ordering::Relaxed) && self.exhausted.swap(false, Ordering::AcqRel) {
            info!("buffer pool recovered");
        }
        if storage.len() != self.buffer_size {
            return;
        }
        let mut free = self.free_list();
        if free.len() < self.max_free {
            free.push(storage);
        }
    }
}

impl BufferPool {
    /// `max_free` bounds the retained free list; `max_outstanding` bounds buffers in flight.
    pub fn new(buffer_size: usize, max_free: usize, max_outstanding: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                max_free,
                max_outstanding,
                free: Mutex::new(Vec::with_capacity(max_free.min(1024))),
                outstanding: AtomicUsize::new(0),
                allocated_total: AtomicU64::new(0),
                exhausted: AtomicBool::new(false),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn acquire(&self) -> Result<Buffer, PoolExhausted> {
        let inner = &self.inner;
        inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < inner.max_outstanding).then_some(n + 1)
            })
            .map_err(|outstanding| {
                if !inner.exhausted.swap(true, Ordering::AcqRel) {
                    warn!(outstanding, "buffer pool exhausted, dropping packets");
                }
                PoolExhausted { outstanding }
            })?;

        let storage = inner.free_list().pop().unwrap_or_else(|| {
            inner.allocated_total.fetch_add(1, Ordering::Relaxed);
            vec![0u8; inner.buffer_size].into_boxed_slice()
        });

        Ok(Buffer {
            storage,
            len: 0,
            pool: Arc::clone(inner),
        })
    }

    /// Returns `buf` to the pool. Equivalent to dropping it.
    pub fn release(&self, buf: Buffer) {
        drop(buf);
    }

    /// Buffers currently handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn free_count(&self) -> usize {
        self.inner.free_list().len()
    }

    /// Number of times a fresh buffer had to be allocated because the free list was empty.
    pub fn allocated_total(&self) -> u64 {
        self.inner.allocated_total.load(Ordering::Relaxed)
    }

    /// True from a failed [`BufferPool::acquire`] until the next buffer is released.
    pub fn is_exhausted(&self) -> bool {
        self.inner.exhausted.load(Ordering::Acquire)
    }

    /// Drops every retained free buffer. Outstanding buffers are unaffected and still return to the
    /// pool when released.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.inner.free_list());
        drop(drained);
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("outstanding", &self.outstanding())
            .field("free", &self.free_count())
            .finish()
    }
}

/// Exclusively owned packet storage of fixed capacity with a valid-length marker.
pub struct Buffer {
    storage: Box<[u8]>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl Buffer {
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The full capacity, for filling from a read or a packet builder. Follow with
    /// [`Buffer::set_len`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    /// Marks the first `len` bytes as valid, clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.storage.len());
    }

    /// Fills the buffer with `write`, which returns the number of bytes it produced.
    pub fn fill_with<E>(
        &mut self,
        write: impl FnOnce(&mut [u8]) -> Result<usize, E>,
    ) -> Result<usize, E> {
        let n = write(&mut self.storage)?;
        self.set_len(n);
        Ok(self.len)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[..self.len]
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let storage = std::mem::take(&mut self.storage);
        self.pool.give_back(storage);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("capacity", &self.storage.len())
            .finish()
    }
}
