use std::sync::Arc;

use test_case::test_case;

use crate::allocator::DEFAULT_ALIGNMENT;
use crate::{Allocator, BufferOptions, CpuAllocator, Error, PooledAllocator, RawBuffer};

#[test_case(1; "byte")]
#[test_case(16; "simd")]
#[test_case(64; "cache_line")]
#[test_case(4096; "page")]
fn test_host_buffer_is_aligned(alignment: usize) {
    let raw = RawBuffer::host(100, alignment).unwrap();
    assert_eq!(raw.as_ptr() as usize % alignment, 0);
    assert_eq!(raw.size(), 100);
    assert_eq!(raw.alignment(), alignment);
}

#[test_case(0; "zero")]
#[test_case(3; "odd")]
#[test_case(48; "not_power_of_two")]
fn test_invalid_alignment_rejected(alignment: usize) {
    let err = RawBuffer::host(16, alignment).unwrap_err();
    assert!(matches!(err, Error::InvalidAlignment { .. }), "got {err}");
}

#[test]
fn test_zero_sized_buffer_has_aligned_address() {
    let raw = RawBuffer::host(0, 32).unwrap();
    assert_eq!(raw.size(), 0);
    assert!(raw.as_slice().is_empty());
    assert_eq!(raw.as_ptr() as usize % 32, 0);
}

#[test]
fn test_cpu_allocator_zeroes() {
    let raw = CpuAllocator.acquire(64, &BufferOptions::default()).unwrap();
    assert!(raw.as_slice().iter().all(|b| *b == 0));
    assert_eq!(raw.alignment(), DEFAULT_ALIGNMENT);
}

#[test]
fn test_overflowing_request_fails() {
    let err = CpuAllocator.acquire(usize::MAX, &BufferOptions::aligned(64)).unwrap_err();
    assert!(matches!(err, Error::AllocationFailed { .. }), "got {err}");
}

#[test]
fn test_pool_reuses_released_storage() {
    let pool = PooledAllocator::new(Arc::new(CpuAllocator));
    let options = BufferOptions::aligned(64);

    let first = pool.acquire(256, &options).unwrap();
    let addr = first.as_ptr() as usize;
    pool.release(first);

    let second = pool.acquire(256, &options).unwrap();
    assert_eq!(second.as_ptr() as usize, addr);

    let stats = pool.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.released, 1);
    assert_eq!(stats.cached, 0);
}

#[test]
fn test_pool_keys_on_alignment() {
    let pool = PooledAllocator::new(Arc::new(CpuAllocator));
    let loose = pool.acquire(128, &BufferOptions::aligned(8)).unwrap();
    pool.release(loose);

    let strict = pool.acquire(128, &BufferOptions::aligned(256)).unwrap();
    assert_eq!(strict.as_ptr() as usize % 256, 0);
    assert_eq!(pool.stats().hits, 0);
    assert_eq!(pool.stats().cached, 1);
}

#[test]
fn test_pool_zeroes_reused_buffer_on_request() {
    let pool = PooledAllocator::new(Arc::new(CpuAllocator));
    let mut dirty = pool.acquire(32, &BufferOptions::aligned(16)).unwrap();
    dirty.as_mut_slice().fill(0xAB);
    pool.release(dirty);

    let options = BufferOptions { alignment: 16, zero_init: true };
    let clean = pool.acquire(32, &options).unwrap();
    assert!(clean.as_slice().iter().all(|b| *b == 0));
}

#[test]
fn test_pool_capacity_bounds_cache() {
    let pool = PooledAllocator::with_capacity(Arc::new(CpuAllocator), 2);
    let options = BufferOptions::aligned(64);
    let buffers: Vec<_> = (0..4).map(|_| pool.acquire(64, &options).unwrap()).collect();
    for buffer in buffers {
        pool.release(buffer);
    }
    assert_eq!(pool.stats().cached, 2);
    assert_eq!(pool.stats().released, 4);

    pool.trim();
    assert_eq!(pool.stats().cached, 0);
}

#[test]
fn test_pool_name_wraps_inner() {
    let pool = PooledAllocator::new(Arc::new(CpuAllocator));
    assert_eq!(pool.name(), "POOL(CPU)");
}

#[test]
fn test_pool_concurrent_acquire_release() {
    let pool = Arc::new(PooledAllocator::with_capacity(Arc::new(CpuAllocator), 64));
    std::thread::scope(|s| {
        for t in 0..8u8 {
            let pool = Arc::clone(&pool);
            s.spawn(move || {
                for _ in 0..50 {
                    let mut raw = pool.acquire(512, &BufferOptions::aligned(64)).unwrap();
                    raw.as_mut_slice().fill(t);
                    assert!(raw.as_slice().iter().all(|b| *b == t));
                    pool.release(raw);
                }
            });
        }
    });
    let stats = pool.stats();
    assert_eq!(stats.hits + stats.misses, 400);
    assert_eq!(stats.released, 400);
}
