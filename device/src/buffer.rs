use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use snafu::ensure;

use crate::allocator::{Allocator, BufferOptions, RawBuffer};
use crate::error::{Result, SizeMismatchSnafu};

/// Process-unique identity of one allocation, used to reason about aliasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

impl BufferId {
    fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// An exclusively owned, aligned buffer.
///
/// The region is returned to the allocator it came from exactly once, when the
/// allocation is dropped. Two `BufferAllocation`s never share storage.
#[derive(Debug)]
pub struct BufferAllocation {
    /// Always `Some` until `Drop` takes it.
    raw: Option<RawBuffer>,
    allocator: Arc<dyn Allocator>,
    id: BufferId,
}

impl BufferAllocation {
    /// Acquire `size` bytes from `allocator`.
    pub fn acquire(allocator: Arc<dyn Allocator>, size: usize, options: &BufferOptions) -> Result<Self> {
        let raw = allocator.acquire(size, options)?;
        ensure!(raw.size() == size, SizeMismatchSnafu { expected: size, actual: raw.size() });
        Ok(Self { raw: Some(raw), allocator, id: BufferId::next() })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.raw().size()
    }

    pub fn alignment(&self) -> usize {
        self.raw().alignment()
    }

    /// Name of the allocator that owns the storage.
    pub fn allocator(&self) -> &dyn Allocator {
        &*self.allocator
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.raw().as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.raw_mut().as_mut_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.raw().as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.raw_mut().as_mut_slice()
    }

    /// Copy host bytes into the buffer. Lengths must match exactly.
    pub fn copyin(&mut self, src: &[u8]) -> Result<()> {
        let expected = self.size();
        ensure!(src.len() == expected, SizeMismatchSnafu { expected, actual: src.len() });
        self.as_mut_slice().copy_from_slice(src);
        Ok(())
    }

    /// Copy the buffer out to host bytes. Lengths must match exactly.
    pub fn copyout(&self, dst: &mut [u8]) -> Result<()> {
        let expected = self.size();
        ensure!(dst.len() == expected, SizeMismatchSnafu { expected, actual: dst.len() });
        dst.copy_from_slice(self.as_slice());
        Ok(())
    }

    fn raw(&self) -> &RawBuffer {
        // Only `Drop` empties the slot.
        self.raw.as_ref().unwrap_or_else(|| unreachable!("buffer used after release"))
    }

    fn raw_mut(&mut self) -> &mut RawBuffer {
        self.raw.as_mut().unwrap_or_else(|| unreachable!("buffer used after release"))
    }
}

impl Drop for BufferAllocation {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.allocator.release(raw);
        }
    }
}
