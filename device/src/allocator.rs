use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use snafu::ensure;
use tracing::trace;

use crate::error::{AllocationFailedSnafu, InvalidAlignmentSnafu, Result};

/// Alignment used when a request does not ask for anything stricter (one cache line).
pub const DEFAULT_ALIGNMENT: usize = 64;

/// An aligned region of host memory.
///
/// The backing storage is over-allocated by `alignment - 1` bytes and the usable
/// region starts at the first aligned address inside it. Moving a `RawBuffer`
/// never moves the region itself.
#[derive(Debug)]
pub struct RawBuffer {
    storage: Box<[u8]>,
    offset: usize,
    len: usize,
    alignment: usize,
}

impl RawBuffer {
    /// Allocate `size` zeroed bytes starting at an address aligned to `alignment`.
    pub fn host(size: usize, alignment: usize) -> Result<Self> {
        ensure!(alignment.is_power_of_two(), InvalidAlignmentSnafu { alignment });

        let fail = |reason: &str| AllocationFailedSnafu { allocator: "CPU", size, alignment, reason }.build();

        // Zero-sized requests still get a real, aligned address.
        let total = size.max(1).checked_add(alignment - 1).ok_or_else(|| fail("size overflow"))?;

        let mut storage = Vec::new();
        storage.try_reserve_exact(total).map_err(|e| fail(&e.to_string()))?;
        storage.resize(total, 0u8);
        let storage = storage.into_boxed_slice();

        let offset = storage.as_ptr().align_offset(alignment);
        if offset >= alignment || offset + size > storage.len() {
            return Err(fail("could not align backing storage"));
        }

        Ok(Self { storage, offset, len: size, alignment })
    }

    /// Usable size in bytes.
    pub fn size(&self) -> usize {
        self.len
    }

    /// Guaranteed alignment of [`RawBuffer::as_ptr`].
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.as_mut_slice().as_mut_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }

    /// Fill the usable region with zeroes.
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

/// Options for a single allocation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferOptions {
    /// Minimum alignment of the returned region. Must be a power of two.
    pub alignment: usize,
    /// Whether the region must be zeroed before it is handed out.
    pub zero_init: bool,
}

impl BufferOptions {
    pub fn aligned(alignment: usize) -> Self {
        Self { alignment, ..Default::default() }
    }
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self { alignment: DEFAULT_ALIGNMENT, zero_init: false }
    }
}

/// Source of buffer memory for execution contexts.
///
/// Implementations must serialize their own internal state: contexts on different
/// threads may acquire and release concurrently. Ownership of an acquired buffer
/// belongs to the caller until it is passed back to [`Allocator::release`].
pub trait Allocator: Send + Sync + std::fmt::Debug {
    fn acquire(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer>;

    fn release(&self, _buffer: RawBuffer) {}

    fn name(&self) -> &str;
}

/// Direct host allocator; every acquire is a fresh allocation.
#[derive(Debug, Clone)]
pub struct CpuAllocator;

impl Allocator for CpuAllocator {
    fn acquire(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        // Fresh host allocations are always zeroed.
        RawBuffer::host(size, options.alignment)
    }

    fn name(&self) -> &str {
        "CPU"
    }
}

/// Cache key for buffer reuse.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
struct CacheKey {
    size: usize,
    alignment: usize,
}

/// Counters describing a pool's behavior so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Acquires served from the cache.
    pub hits: usize,
    /// Acquires forwarded to the inner allocator.
    pub misses: usize,
    /// Buffers handed back through `release`.
    pub released: usize,
    /// Buffers currently held in the cache.
    pub cached: usize,
}

/// Caching allocator that keeps released buffers for reuse.
///
/// Buffers are grouped by exact `(size, alignment)`; at most
/// `max_buffers_per_size` are kept per group and the rest go back to the inner
/// allocator.
#[derive(Debug)]
pub struct PooledAllocator {
    inner: Arc<dyn Allocator>,
    cache: Mutex<HashMap<CacheKey, Vec<RawBuffer>>>,
    max_buffers_per_size: usize,
    name: String,
    hits: AtomicUsize,
    misses: AtomicUsize,
    released: AtomicUsize,
}

impl PooledAllocator {
    pub fn new(inner: Arc<dyn Allocator>) -> Self {
        Self::with_capacity(inner, 32)
    }

    pub fn with_capacity(inner: Arc<dyn Allocator>, max_buffers_per_size: usize) -> Self {
        let name = format!("POOL({})", inner.name());
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
            max_buffers_per_size,
            name,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let cached = self.cache.lock().values().map(Vec::len).sum();
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            cached,
        }
    }

    /// Drop every cached buffer back to the inner allocator.
    pub fn trim(&self) {
        let drained: Vec<RawBuffer> = self.cache.lock().drain().flat_map(|(_, buffers)| buffers).collect();
        for buffer in drained {
            self.inner.release(buffer);
        }
    }
}

impl Allocator for PooledAllocator {
    fn acquire(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        ensure!(options.alignment.is_power_of_two(), InvalidAlignmentSnafu { alignment: options.alignment });
        let key = CacheKey { size, alignment: options.alignment };

        let cached = {
            let mut cache = self.cache.lock();
            let buffer = cache.get_mut(&key).and_then(Vec::pop);
            if cache.get(&key).is_some_and(Vec::is_empty) {
                cache.remove(&key);
            }
            buffer
        };

        if let Some(mut buffer) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            if options.zero_init {
                buffer.zero();
            }
            trace!(size, alignment = options.alignment, "pool hit");
            return Ok(buffer);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match self.inner.acquire(size, options) {
            Ok(buffer) => Ok(buffer),
            Err(e) => {
                // Give cached memory back and retry once before reporting failure.
                self.trim();
                self.inner.acquire(size, options).map_err(|_| e)
            }
        }
    }

    fn release(&self, buffer: RawBuffer) {
        self.released.fetch_add(1, Ordering::Relaxed);
        let key = CacheKey { size: buffer.size(), alignment: buffer.alignment() };

        let overflow = {
            let mut cache = self.cache.lock();
            let buffers = cache.entry(key).or_default();
            if buffers.len() < self.max_buffers_per_size {
                buffers.push(buffer);
                None
            } else {
                Some(buffer)
            }
        };

        if let Some(buffer) = overflow {
            self.inner.release(buffer);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
