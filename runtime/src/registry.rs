//! Process-wide function registry.
//!
//! Maps a [`FunctionKey`] to the compiled function registered under it together
//! with its [`SignatureDescriptor`]. Uses papaya's lock-free HashMap so lookups
//! from any number of invocation paths never contend.
//!
//! # Lifecycle
//!
//! The registry starts in [`RegistryPhase::Initializing`], where registrations are
//! accepted (serialized by a mutex so that concurrent loaders cannot race on the
//! same key). [`FunctionRegistry::freeze`] moves it to [`RegistryPhase::Frozen`]:
//! from then on it is read-only until process exit. Entries are never removed
//! or replaced.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;
use papaya::HashMap;
use parking_lot::Mutex;
use snafu::ensure;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::entry::EntryPoint;
use crate::error::{
    DuplicateKeySnafu, Error, IncompatibleSignatureVersionSnafu, NotFoundSnafu, RegistryFrozenSnafu, Result,
    SignatureHashMismatchSnafu,
};
use crate::signature::{FunctionKey, SIGNATURE_FORMAT_VERSION, SignatureDescriptor};

/// A registered compiled function and its contract. Immutable.
pub struct RegistryEntry {
    key: FunctionKey,
    descriptor: Arc<SignatureDescriptor>,
    entry: Arc<dyn EntryPoint>,
}

impl RegistryEntry {
    pub fn key(&self) -> &FunctionKey {
        &self.key
    }

    pub fn descriptor(&self) -> &Arc<SignatureDescriptor> {
        &self.descriptor
    }

    pub fn entry_point(&self) -> &dyn EntryPoint {
        &*self.entry
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("key", &self.key)
            .field("descriptor", &self.descriptor)
            .field("entry", &self.entry.name())
            .finish()
    }
}

/// Registry lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryPhase {
    /// Registrations accepted.
    Initializing,
    /// Read-only.
    Frozen,
}

/// Table of compiled functions.
pub struct FunctionRegistry {
    entries: HashMap<FunctionKey, Arc<RegistryEntry>>,
    /// Serializes registration and freezing; never taken by lookups.
    registration: Mutex<()>,
    frozen: AtomicBool,
    verify_signature_hash: bool,
}

/// The key's hash must be the content hash of `descriptor`.
pub fn verify_signature_hash(key: &FunctionKey, descriptor: &SignatureDescriptor) -> Result<()> {
    let actual = descriptor.signature_hash();
    ensure!(key.signature_hash() == actual, SignatureHashMismatchSnafu { key: key.clone(), actual });
    Ok(())
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::with_config(&RuntimeConfig::default())
    }

    pub fn with_config(config: &RuntimeConfig) -> Self {
        Self {
            entries: HashMap::new(),
            registration: Mutex::new(()),
            frozen: AtomicBool::new(false),
            verify_signature_hash: config.verify_signature_hash,
        }
    }

    /// Register a compiled function.
    ///
    /// Fails without touching the table when the descriptor is malformed or was
    /// produced for another descriptor format, when the key is already present
    /// (re-registration is never an update), or when the registry is frozen.
    pub fn register(
        &self,
        key: FunctionKey,
        descriptor: SignatureDescriptor,
        entry: Arc<dyn EntryPoint>,
    ) -> Result<Arc<RegistryEntry>> {
        let result = self.try_register(key, descriptor, entry);
        if let Err(e) = &result {
            warn!(error = %e, "registration rejected");
        }
        result
    }

    fn try_register(
        &self,
        key: FunctionKey,
        descriptor: SignatureDescriptor,
        entry: Arc<dyn EntryPoint>,
    ) -> Result<Arc<RegistryEntry>> {
        ensure!(
            descriptor.format_version == SIGNATURE_FORMAT_VERSION,
            IncompatibleSignatureVersionSnafu { expected: SIGNATURE_FORMAT_VERSION, actual: descriptor.format_version }
        );
        descriptor.validate()?;

        if self.verify_signature_hash {
            verify_signature_hash(&key, &descriptor)?;
        }

        let _registration = self.registration.lock();
        ensure!(!self.is_frozen(), RegistryFrozenSnafu { key: key.clone() });

        let guard = self.entries.guard();
        ensure!(!self.entries.contains_key(&key, &guard), DuplicateKeySnafu { key: key.clone() });

        let registered = Arc::new(RegistryEntry { key: key.clone(), descriptor: Arc::new(descriptor), entry });
        self.entries.insert(key, Arc::clone(&registered), &guard);

        debug!(
            function.key = %registered.key,
            function.entry = registered.entry.name(),
            inputs = registered.descriptor.inputs.len(),
            outputs = registered.descriptor.outputs.len(),
            scratch = registered.descriptor.scratch.len(),
            "function registered"
        );
        Ok(registered)
    }

    /// Look up a registered function.
    pub fn lookup(&self, key: &FunctionKey) -> Result<Arc<RegistryEntry>> {
        let guard = self.entries.guard();
        self.entries.get(key, &guard).map(Arc::clone).ok_or_else(|| NotFoundSnafu { key: key.clone() }.build())
    }

    /// Every variant registered under `name`, ordered by signature hash.
    pub fn variants(&self, name: &str) -> Vec<Arc<RegistryEntry>> {
        let guard = self.entries.guard();
        let mut found: Vec<_> =
            self.entries.iter(&guard).filter(|(key, _)| key.name() == name).map(|(_, e)| Arc::clone(e)).collect();
        found.sort_by_key(|e| e.key.signature_hash());
        found
    }

    /// All registered keys, sorted.
    pub fn keys(&self) -> Vec<FunctionKey> {
        let guard = self.entries.guard();
        let mut keys: Vec<_> = self.entries.iter(&guard).map(|(key, _)| key.clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// End the initialization phase. Idempotent.
    pub fn freeze(&self) {
        let _registration = self.registration.lock();
        if !self.frozen.swap(true, Ordering::AcqRel) {
            debug!(functions = self.entries.len(), "function registry frozen");
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> RegistryPhase {
        if self.is_frozen() { RegistryPhase::Frozen } else { RegistryPhase::Initializing }
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry").field("phase", &self.phase()).field("functions", &self.len()).finish()
    }
}

/// Global function registry.
///
/// Lazily created on first access with configuration from the environment, and
/// never cleared.
static REGISTRY: Lazy<Arc<FunctionRegistry>> =
    Lazy::new(|| Arc::new(FunctionRegistry::with_config(&RuntimeConfig::from_env())));

/// Get the global function registry.
pub fn registry() -> Arc<FunctionRegistry> {
    Arc::clone(&REGISTRY)
}

/// Look up `key` in the global registry.
pub fn lookup(key: &FunctionKey) -> Result<Arc<RegistryEntry>, Error> {
    REGISTRY.lookup(key)
}
