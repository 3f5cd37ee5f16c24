//! Lock-free UDP buffer pool
//!
//! Every datagram read from the virtual UDP endpoint lands in a buffer
//! borrowed from this pool. The pool is shared by all UDP workers and by the
//! DNS relay tasks they spawn, so borrow and release must be safe from many
//! tasks at once. `crossbeam-queue::ArrayQueue` keeps both operations
//! lock-free.
//!
//! # Ownership
//!
//! A borrowed buffer is a [`PooledBuffer`]. It returns itself to the pool when
//! dropped, and [`PooledBuffer::release`] consumes it, so a buffer can only be
//! released once and cannot be touched after release.
//!
//! # Example
//!
//! ```
//! use tun_bridge::io::UdpBufferPool;
//! use std::sync::Arc;
//!
//! let pool = Arc::new(UdpBufferPool::new(64, 2048));
//!
//! let mut buffer = pool.get();
//! buffer[..3].copy_from_slice(b"abc");
//! buffer.truncate(3);
//! assert_eq!(&buffer[..], b"abc");
//!
//! buffer.release();
//! assert_eq!(pool.stats().outstanding(), 0);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Default UDP buffer size (16 KiB covers every datagram below a 9000-byte MTU)
pub const DEFAULT_UDP_BUFFER_SIZE: usize = 16 * 1024;

/// Default pool capacity (number of retained buffers)
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Statistics for the buffer pool
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    /// Number of new buffer allocations (pool was empty)
    allocations: AtomicU64,
    /// Number of buffer reuses from pool
    reuses: AtomicU64,
    /// Number of buffers returned to pool
    returns: AtomicU64,
    /// Number of buffers freed on release because the pool was full
    drops: AtomicU64,
}

impl BufferPoolStats {
    /// Get the number of allocations
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Get the number of reuses
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Get the number of returns
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Get the number of drops
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Total number of borrows
    #[must_use]
    pub fn borrows(&self) -> u64 {
        self.allocations() + self.reuses()
    }

    /// Total number of releases, whether retained or freed
    #[must_use]
    pub fn releases(&self) -> u64 {
        self.returns() + self.drops()
    }

    /// Buffers currently borrowed and not yet released
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.borrows().saturating_sub(self.releases())
    }

    /// Get a snapshot of all stats
    #[must_use]
    pub fn snapshot(&self) -> BufferPoolStatsSnapshot {
        BufferPoolStatsSnapshot {
            allocations: self.allocations(),
            reuses: self.reuses(),
            returns: self.returns(),
            drops: self.drops(),
        }
    }
}

/// Snapshot of buffer pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BufferPoolStatsSnapshot {
    /// Number of new buffer allocations
    pub allocations: u64,
    /// Number of buffer reuses
    pub reuses: u64,
    /// Number of buffers returned
    pub returns: u64,
    /// Number of buffers freed because the pool was full
    pub drops: u64,
}

impl BufferPoolStatsSnapshot {
    /// Buffers borrowed and not released at snapshot time
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        (self.allocations + self.reuses).saturating_sub(self.returns + self.drops)
    }

    /// Pool efficiency (reuses / borrows)
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // Precision loss acceptable for efficiency ratio
    pub fn efficiency(&self) -> f64 {
        let total = self.reuses + self.allocations;
        if total == 0 {
            0.0
        } else {
            self.reuses as f64 / total as f64
        }
    }
}

/// A lock-free pool of fixed-size UDP buffers.
#[derive(Debug)]
pub struct UdpBufferPool {
    /// Idle buffers ready for reuse
    buffers: ArrayQueue<Vec<u8>>,
    /// Size of each buffer
    buffer_size: usize,
    /// Pool statistics
    stats: BufferPoolStats,
}

impl UdpBufferPool {
    /// Create a pool retaining at most `capacity` idle buffers of
    /// `buffer_size` bytes each.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity),
            buffer_size,
            stats: BufferPoolStats::default(),
        }
    }

    /// Create a pool with default settings
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, DEFAULT_UDP_BUFFER_SIZE)
    }

    /// Borrow a buffer, reusing an idle one or allocating a new one.
    ///
    /// Never blocks. The returned buffer exposes `buffer_size` bytes until
    /// [`PooledBuffer::truncate`] narrows it.
    #[must_use]
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buffer = if let Some(mut buf) = self.buffers.pop() {
            self.stats.reuses.fetch_add(1, Ordering::Relaxed);
            buf.resize(self.buffer_size, 0);
            buf
        } else {
            self.stats.allocations.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.buffer_size]
        };

        PooledBuffer {
            len: buffer.len(),
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    /// Hand a buffer back. Freed instead of retained when the pool is full.
    fn return_buffer(&self, mut buffer: Vec<u8>) {
        buffer.clear();

        if self.buffers.push(buffer).is_ok() {
            self.stats.returns.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Allocate up to `count` idle buffers ahead of the first burst.
    pub fn prewarm(&self, count: usize) {
        for _ in 0..count {
            if self.buffers.push(Vec::with_capacity(self.buffer_size)).is_err() {
                break;
            }
        }
    }

    /// Get the buffer size
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Maximum number of idle buffers retained
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffers.capacity()
    }

    /// Number of idle buffers currently retained
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Get pool statistics
    #[must_use]
    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }
}

/// A buffer borrowed from a [`UdpBufferPool`].
///
/// Returns to the pool exactly once: on [`release`](Self::release) or on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    /// The underlying buffer (Option for taking on drop)
    buffer: Option<Vec<u8>>,
    /// Number of bytes exposed through `Deref`
    len: usize,
    /// Owning pool
    pool: Arc<UdpBufferPool>,
}

impl PooledBuffer {
    /// Full capacity of the underlying buffer
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, Vec::len)
    }

    /// Narrow the visible bytes to the first `len` bytes, e.g. after a
    /// receive wrote `len` bytes. Never grows past the capacity.
    pub fn truncate(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    /// Return the buffer to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            self.pool.return_buffer(buf);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self.buffer.as_ref() {
            Some(buf) => &buf[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        let len = self.len;
        match self.buffer.as_mut() {
            Some(buf) => &mut buf[..len],
            None => &mut [],
        }
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for PooledBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

/// Configuration for the buffer pool
#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    /// Pool capacity (number of idle buffers retained)
    pub capacity: usize,
    /// Buffer size in bytes
    pub buffer_size: usize,
    /// Number of buffers to pre-warm
    pub prewarm_count: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
            buffer_size: DEFAULT_UDP_BUFFER_SIZE,
            prewarm_count: 0,
        }
    }
}

impl BufferPoolConfig {
    /// Create a new config with specified values
    #[must_use]
    pub const fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            capacity,
            buffer_size,
            prewarm_count: 0,
        }
    }

    /// Set the prewarm count
    #[must_use]
    pub const fn with_prewarm(mut self, count: usize) -> Self {
        self.prewarm_count = count;
        self
    }

    /// Build the buffer pool
    #[must_use]
    pub fn build(self) -> Arc<UdpBufferPool> {
        let pool = Arc::new(UdpBufferPool::new(self.capacity.max(1), self.buffer_size));
        if self.prewarm_count > 0 {
            pool.prewarm(self.prewarm_count);
        }
        pool
    }
}
