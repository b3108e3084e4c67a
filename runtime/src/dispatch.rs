//! Host-facing entry points.
//!
//! [`Runtime`] ties a [`FunctionRegistry`] to an allocator and a configuration,
//! and wraps the lookup → prepare → invoke sequence into single calls.

use std::cmp::Reverse;
use std::sync::Arc;

use kiln_device::{Allocator, PooledAllocator};
use once_cell::sync::Lazy;
use snafu::OptionExt;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::context::ExecutionContext;
use crate::entry::EntryPoint;
use crate::error::{NoMatchingVariantSnafu, Result};
use crate::registry::{self, FunctionRegistry, RegistryEntry};
use crate::signature::{FunctionKey, SignatureDescriptor};
use crate::tensor::{Tensor, TensorView};
use crate::validator;

/// A registry plus the resources every invocation draws from.
#[derive(Debug, Clone)]
pub struct Runtime {
    registry: Arc<FunctionRegistry>,
    allocator: Arc<dyn Allocator>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Runtime over `registry` allocating directly from the CPU.
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self::with_config(registry, RuntimeConfig::default())
    }

    pub fn with_config(registry: Arc<FunctionRegistry>, config: RuntimeConfig) -> Self {
        Self { registry, allocator: kiln_device::cpu(), config }
    }

    /// Runtime whose buffers are cached in a [`PooledAllocator`] over the CPU.
    pub fn pooled(registry: Arc<FunctionRegistry>, config: RuntimeConfig) -> Self {
        let pool = PooledAllocator::with_capacity(kiln_device::cpu(), config.pool_capacity);
        Self { registry, allocator: Arc::new(pool), config }
    }

    /// Replace the allocator buffers are acquired from.
    pub fn with_allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Runtime over the global registry, with a pooled allocator.
    pub fn global() -> Self {
        static GLOBAL: Lazy<Runtime> = Lazy::new(|| {
            let config = RuntimeConfig::from_env();
            Runtime::pooled(registry::registry(), config)
        });
        GLOBAL.clone()
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a compiled function. See [`FunctionRegistry::register`].
    ///
    /// With `verify_signature_hash` on, the key's hash is checked against the
    /// descriptor even when the registry itself was built without that check.
    pub fn register(
        &self,
        key: FunctionKey,
        descriptor: SignatureDescriptor,
        entry: Arc<dyn EntryPoint>,
    ) -> Result<Arc<RegistryEntry>> {
        if self.config.verify_signature_hash {
            registry::verify_signature_hash(&key, &descriptor)
                .inspect_err(|e| warn!(error = %e, "registration rejected"))?;
        }
        self.registry.register(key, descriptor, entry)
    }

    /// A fresh execution context for `entry`.
    pub fn context<'a>(&self, entry: Arc<RegistryEntry>) -> ExecutionContext<'a> {
        ExecutionContext::new(entry, Arc::clone(&self.allocator), self.config.plan_options())
    }

    /// Look up `key`, validate `inputs`, run the function and return its outputs.
    ///
    /// On any error no buffer stays allocated.
    pub fn lookup_and_invoke(&self, key: &FunctionKey, inputs: &[TensorView<'_>]) -> Result<Vec<Tensor>> {
        let entry = self.registry.lookup(key)?;
        self.invoke_entry(entry, inputs)
    }

    /// Choose the registered variant of `name` for `inputs`.
    ///
    /// Variants that accept the inputs are narrowed to those no other accepting
    /// variant is strictly more precise than. Precision is partial, so among the
    /// remaining ones the most fixed input dimensions win and ties go to the
    /// smallest signature hash.
    pub fn select(&self, name: &str, inputs: &[TensorView<'_>]) -> Result<Arc<RegistryEntry>> {
        let candidates = self.registry.variants(name);
        let total = candidates.len();

        let accepting: Vec<_> =
            candidates.into_iter().filter(|entry| validator::accepts(entry.descriptor(), inputs)).collect();
        let selected = accepting
            .iter()
            .filter(|entry| {
                !accepting.iter().any(|other| strictly_more_precise(other.descriptor(), entry.descriptor()))
            })
            .max_by_key(|entry| (fixed_dims(entry.descriptor()), Reverse(entry.key().signature_hash())))
            .map(Arc::clone)
            .context(NoMatchingVariantSnafu { name, candidates: total })?;

        debug!(function.name = name, function.key = %selected.key(), candidates = total, "variant selected");
        Ok(selected)
    }

    /// [`select`](Self::select) a variant and run it.
    pub fn select_and_invoke(&self, name: &str, inputs: &[TensorView<'_>]) -> Result<Vec<Tensor>> {
        let entry = self.select(name, inputs)?;
        self.invoke_entry(entry, inputs)
    }

    fn invoke_entry(&self, entry: Arc<RegistryEntry>, inputs: &[TensorView<'_>]) -> Result<Vec<Tensor>> {
        let mut ctx = self.context(entry);
        ctx.prepare(inputs)?;
        ctx.invoke()
    }
}

fn strictly_more_precise(a: &SignatureDescriptor, b: &SignatureDescriptor) -> bool {
    a.inputs_more_precise_than(b) && !b.inputs_more_precise_than(a)
}

/// Number of fixed input dimensions.
fn fixed_dims(descriptor: &SignatureDescriptor) -> usize {
    descriptor.inputs.iter().flat_map(|spec| &spec.dims).filter(|dim| dim.fixed().is_some()).count()
}
