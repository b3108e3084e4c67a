//! Signature descriptors: the contract a compiled function declares.
//!
//! A descriptor lists the function's input and output tensor specs, the scratch
//! buffers its memory plan needs, and which outputs may reuse which scratch
//! storage. Descriptors are produced by the offline compiler, validated once at
//! registration, and shared read-only by every invocation afterwards.

use std::fmt;
use std::hash::{Hash, Hasher};

use kiln_device::allocator::DEFAULT_ALIGNMENT;
use kiln_dtype::DType;
use smallvec::SmallVec;
use snafu::ensure;

use crate::error::{InvalidDescriptorSnafu, Result};

/// Descriptor format understood by this runtime.
///
/// Bumped whenever the set of descriptor fields or their meaning changes, so that
/// artifacts compiled against another format are rejected instead of misread.
pub const SIGNATURE_FORMAT_VERSION: u32 = 1;

// ============================================================================
// KEYS
// ============================================================================

/// Identifies one compiled function variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionKey {
    name: String,
    signature_hash: u64,
}

impl FunctionKey {
    pub fn new(name: impl Into<String>, signature_hash: u64) -> Self {
        Self { name: name.into(), signature_hash }
    }

    /// Key whose hash is the content hash of `descriptor`.
    pub fn for_descriptor(name: impl Into<String>, descriptor: &SignatureDescriptor) -> Self {
        Self::new(name, descriptor.signature_hash())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature_hash(&self) -> u64 {
        self.signature_hash
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:#x}", self.name, self.signature_hash)
    }
}

// ============================================================================
// TENSOR SPECS
// ============================================================================

/// One dimension of a declared tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dim {
    /// Extent fixed at compile time.
    Fixed(usize),
    /// Named dynamic extent. Every occurrence of the same name within one
    /// invocation must bind to the same value.
    Symbol(String),
    /// Anonymous dynamic extent: accepts anything and binds nothing. Inputs only.
    Dynamic,
}

impl Dim {
    pub fn symbol(name: impl Into<String>) -> Self {
        Self::Symbol(name.into())
    }

    pub fn fixed(&self) -> Option<usize> {
        match self {
            Self::Fixed(n) => Some(*n),
            _ => None,
        }
    }

    pub fn symbol_name(&self) -> Option<&str> {
        match self {
            Self::Symbol(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        !matches!(self, Self::Fixed(_))
    }

    /// Two dims are consistent unless both are fixed and differ.
    pub fn is_consistent_with(&self, other: &Dim) -> bool {
        match (self, other) {
            (Self::Fixed(a), Self::Fixed(b)) => a == b,
            _ => true,
        }
    }

    /// `self` is at least as precise as `other` if `other` is dynamic or both are
    /// the same fixed extent.
    pub fn is_more_precise_than(&self, other: &Dim) -> bool {
        match other {
            Self::Fixed(b) => self.fixed() == Some(*b),
            Self::Symbol(_) | Self::Dynamic => true,
        }
    }
}

impl From<usize> for Dim {
    fn from(n: usize) -> Self {
        Self::Fixed(n)
    }
}

impl From<&str> for Dim {
    fn from(name: &str) -> Self {
        Self::Symbol(name.to_string())
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "{n}"),
            Self::Symbol(name) => f.write_str(name),
            Self::Dynamic => f.write_str("?"),
        }
    }
}

/// Memory layout a compiled function requires of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Layout {
    /// Data must be dense row-major.
    pub contiguous: bool,
    /// Minimum byte alignment of the data pointer (power of two).
    pub alignment: usize,
}

impl Default for Layout {
    fn default() -> Self {
        Self { contiguous: true, alignment: 1 }
    }
}

/// Declared type, shape and layout of one tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorSpec {
    pub dtype: DType,
    pub dims: SmallVec<[Dim; 4]>,
    pub layout: Layout,
}

impl TensorSpec {
    /// Contiguous spec with no alignment requirement beyond the element width.
    pub fn new<D: Into<Dim>>(dtype: DType, dims: impl IntoIterator<Item = D>) -> Self {
        let layout = Layout { contiguous: true, alignment: dtype.bytes() };
        Self { dtype, dims: dims.into_iter().map(Into::into).collect(), layout }
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.layout.alignment = alignment;
        self
    }

    /// Accept arbitrary strides.
    pub fn strided(mut self) -> Self {
        self.layout.contiguous = false;
        self
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|d| !d.is_dynamic())
    }

    /// Symbol names in order of appearance (with repeats).
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.dims.iter().filter_map(Dim::symbol_name)
    }

    /// Same dtype and rank, and every pair of dims is consistent.
    pub fn is_consistent_with(&self, other: &TensorSpec) -> bool {
        self.dtype == other.dtype
            && self.rank() == other.rank()
            && self.dims.iter().zip(&other.dims).all(|(a, b)| a.is_consistent_with(b))
    }

    /// Consistent, and no dim of `self` is less constrained than the matching dim of `other`.
    pub fn is_more_precise_than(&self, other: &TensorSpec) -> bool {
        self.is_consistent_with(other) && self.dims.iter().zip(&other.dims).all(|(a, b)| a.is_more_precise_than(b))
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

// ============================================================================
// SCRATCH REQUESTS
// ============================================================================

/// Byte size of a scratch buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SizeExpr {
    /// Known at compile time.
    Bytes(usize),
    /// `bytes_per_unit * product(dims)` once the named dims are bound.
    Scaled { bytes_per_unit: usize, dims: Vec<String> },
}

impl SizeExpr {
    pub fn scaled<S: Into<String>>(bytes_per_unit: usize, dims: impl IntoIterator<Item = S>) -> Self {
        Self::Scaled { bytes_per_unit, dims: dims.into_iter().map(Into::into).collect() }
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        let dims: &[String] = match self {
            Self::Bytes(_) => &[],
            Self::Scaled { dims, .. } => dims,
        };
        dims.iter().map(String::as_str)
    }
}

impl From<usize> for SizeExpr {
    fn from(bytes: usize) -> Self {
        Self::Bytes(bytes)
    }
}

/// How long a scratch buffer's contents matter inside the compiled function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// Live for the entire call; never shared with an output.
    Scratch,
    /// Dead after phase `last_use`; an output produced at or after that phase may
    /// take over its storage.
    Aliasable { last_use: u32 },
}

/// One scratch buffer of the memory plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferRequest {
    pub name: String,
    pub size: SizeExpr,
    pub alignment: usize,
    pub lifetime: Lifetime,
}

impl BufferRequest {
    pub fn new(name: impl Into<String>, size: impl Into<SizeExpr>) -> Self {
        Self { name: name.into(), size: size.into(), alignment: DEFAULT_ALIGNMENT, lifetime: Lifetime::Scratch }
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn aliasable(mut self, last_use: u32) -> Self {
        self.lifetime = Lifetime::Aliasable { last_use };
        self
    }
}

/// Declares that `output` may be written into scratch slot `scratch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AliasRule {
    pub output: usize,
    pub scratch: usize,
    /// Phase in which the output is first written.
    pub produced_at: u32,
}

// ============================================================================
// DESCRIPTOR
// ============================================================================

/// Full contract of one compiled function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignatureDescriptor {
    pub format_version: u32,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub scratch: Vec<BufferRequest>,
    pub aliases: Vec<AliasRule>,
}

impl SignatureDescriptor {
    pub fn new(inputs: Vec<TensorSpec>, outputs: Vec<TensorSpec>) -> Self {
        Self { format_version: SIGNATURE_FORMAT_VERSION, inputs, outputs, scratch: Vec::new(), aliases: Vec::new() }
    }

    pub fn with_scratch(mut self, request: BufferRequest) -> Self {
        self.scratch.push(request);
        self
    }

    pub fn with_alias(mut self, output: usize, scratch: usize, produced_at: u32) -> Self {
        self.aliases.push(AliasRule { output, scratch, produced_at });
        self
    }

    /// Content hash (xxh64) of every field, used as the signature part of a key.
    pub fn signature_hash(&self) -> u64 {
        use xxhash_rust::xxh64::Xxh64;

        let mut hasher = Xxh64::new(0);
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Every input of `self` is at least as precise as the matching input of `other`.
    pub fn inputs_more_precise_than(&self, other: &SignatureDescriptor) -> bool {
        self.inputs.len() == other.inputs.len()
            && self.inputs.iter().zip(&other.inputs).all(|(a, b)| a.is_more_precise_than(b))
    }

    /// Every symbol name, deduplicated, in order of first appearance across
    /// inputs, outputs and scratch sizes. This is the order in which bound
    /// values are passed to the entry point.
    pub fn symbols(&self) -> Vec<&str> {
        let tensors = self.inputs.iter().chain(&self.outputs).flat_map(TensorSpec::symbols);
        let scratch = self.scratch.iter().flat_map(|r| r.size.symbols());

        let mut seen: Vec<&str> = Vec::new();
        for name in tensors.chain(scratch) {
            if !seen.contains(&name) {
                seen.push(name);
            }
        }
        seen
    }

    /// Check internal consistency. Does not look at the format version.
    pub fn validate(&self) -> Result<()> {
        for (i, spec) in self.inputs.iter().enumerate() {
            let alignment = spec.layout.alignment;
            ensure!(
                alignment.is_power_of_two(),
                InvalidDescriptorSnafu { reason: format!("input {i} alignment {alignment} is not a power of two") }
            );
        }

        for (i, spec) in self.outputs.iter().enumerate() {
            let alignment = spec.layout.alignment;
            ensure!(
                alignment.is_power_of_two(),
                InvalidDescriptorSnafu { reason: format!("output {i} alignment {alignment} is not a power of two") }
            );
            ensure!(
                !spec.dims.contains(&Dim::Dynamic),
                InvalidDescriptorSnafu { reason: format!("output {i} has an anonymous dynamic dimension") }
            );
        }

        for (j, request) in self.scratch.iter().enumerate() {
            ensure!(
                request.alignment.is_power_of_two(),
                InvalidDescriptorSnafu {
                    reason: format!("scratch '{}' alignment {} is not a power of two", request.name, request.alignment)
                }
            );
            ensure!(
                !self.scratch[..j].iter().any(|r| r.name == request.name),
                InvalidDescriptorSnafu { reason: format!("scratch name '{}' is declared twice", request.name) }
            );
        }

        for (n, rule) in self.aliases.iter().enumerate() {
            ensure!(
                rule.output < self.outputs.len(),
                InvalidDescriptorSnafu { reason: format!("alias {n} names missing output {}", rule.output) }
            );
            let Some(request) = self.scratch.get(rule.scratch) else {
                return InvalidDescriptorSnafu { reason: format!("alias {n} names missing scratch {}", rule.scratch) }
                    .fail();
            };
            match request.lifetime {
                Lifetime::Scratch => {
                    return InvalidDescriptorSnafu {
                        reason: format!("alias {n}: scratch '{}' is not aliasable", request.name),
                    }
                    .fail();
                }
                Lifetime::Aliasable { last_use } => ensure!(
                    last_use <= rule.produced_at,
                    InvalidDescriptorSnafu {
                        reason: format!(
                            "alias {n}: scratch '{}' is live until phase {last_use}, output {} is produced at {}",
                            request.name, rule.output, rule.produced_at
                        )
                    }
                ),
            }
            ensure!(
                !self.aliases[..n].iter().any(|r| r.output == rule.output || r.scratch == rule.scratch),
                InvalidDescriptorSnafu { reason: format!("alias {n} reuses an output or scratch slot already aliased") }
            );
        }

        Ok(())
    }
}
