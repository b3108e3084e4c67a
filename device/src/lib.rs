//! Buffer allocation for kiln execution contexts.
//!
//! Every buffer a compiled function touches (outputs and scratch) is a
//! [`BufferAllocation`]: an aligned, exclusively owned region that returns itself
//! to its [`Allocator`] exactly once, when dropped.
//!
//! Hosts that want to amortize allocation across invocations hand the runtime a
//! [`PooledAllocator`]; otherwise [`CpuAllocator`] allocates directly.

pub mod allocator;
pub mod buffer;
pub mod error;


pub use allocator::{Allocator, BufferOptions, CpuAllocator, PoolStats, PooledAllocator, RawBuffer};
pub use buffer::{BufferAllocation, BufferId};
pub use error::*;

use std::sync::Arc;

use once_cell::sync::Lazy;

static CPU: Lazy<Arc<dyn Allocator>> = Lazy::new(|| Arc::new(CpuAllocator));

/// Shared direct allocator, used whenever no pool is supplied.
pub fn cpu() -> Arc<dyn Allocator> {
    Arc::clone(&CPU)
}
