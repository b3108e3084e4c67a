//! Runtime configuration.
//!
//! Typed configuration with a bon builder and environment variable fallbacks.

use bon::bon;

use crate::planner::PlanOptions;

/// Settings shared by the registry and every execution context of a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Reject registrations whose key hash differs from the descriptor's content hash.
    pub verify_signature_hash: bool,
    /// Apply the descriptor's aliasing map when planning buffers.
    pub enable_aliasing: bool,
    /// Buffers kept per `(size, alignment)` class by a pooled allocator.
    pub pool_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { verify_signature_hash: false, enable_aliasing: true, pool_capacity: 32 }
    }
}

#[bon]
impl RuntimeConfig {
    /// Create a configuration with builder pattern.
    #[builder]
    pub fn builder(
        #[builder(default = false)] verify_signature_hash: bool,
        #[builder(default = true)] enable_aliasing: bool,
        #[builder(default = 32)] pool_capacity: usize,
    ) -> Self {
        Self { verify_signature_hash, enable_aliasing, pool_capacity }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `KILN_VERIFY_SIGNATURE_HASH` - Verify key hashes against descriptors if set
    /// * `KILN_DISABLE_ALIASING` - Give every output its own buffer if set
    /// * `KILN_POOL_CAPACITY` - Cached buffers per size class (default: 32)
    pub fn from_env() -> Self {
        let verify_signature_hash = std::env::var("KILN_VERIFY_SIGNATURE_HASH").is_ok();
        let enable_aliasing = std::env::var("KILN_DISABLE_ALIASING").is_err();
        let pool_capacity = std::env::var("KILN_POOL_CAPACITY").ok().and_then(|s| s.parse().ok()).unwrap_or(32);

        Self { verify_signature_hash, enable_aliasing, pool_capacity }
    }

    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions { enable_aliasing: self.enable_aliasing }
    }
}
