//! Memory planner for one invocation.
//!
//! Turns a descriptor plus the bound dimensions of one call into a concrete
//! [`BufferPlan`]: the physical slots to allocate and which output and scratch
//! buffer lives in which slot.
//!
//! # Algorithm
//!
//! 1. **Resolve**: substitute bound dimensions into every output shape and
//!    scratch size expression. An unbound symbol fails with `UnresolvedShape`.
//! 2. **Scratch slots**: each scratch request gets its own slot, in order.
//! 3. **Aliasing**: for each output, the first declared [`AliasRule`] that passes
//!    [`check_alias`] places the output in that scratch slot.
//! 4. **Output slots**: remaining outputs get fresh slots, in order.
//!
//! Every step is deterministic, so the same descriptor and dimensions always give
//! the same plan, and `peak_bytes() <= unaliased_bytes()` holds by construction.

use std::fmt;

use snafu::OptionExt;
use tracing::{debug, trace};

use crate::error::{InvalidDescriptorSnafu, Result, UnresolvedShapeSnafu};
use crate::signature::{AliasRule, BufferRequest, Dim, Lifetime, SignatureDescriptor, SizeExpr, TensorSpec};
use crate::tensor::Shape;
use crate::validator::BoundDims;

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// Planner switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    /// Apply the descriptor's aliasing map.
    pub enable_aliasing: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self { enable_aliasing: true }
    }
}

/// What a physical slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    Scratch(usize),
    Output(usize),
    /// Scratch storage taken over by an output.
    Shared { scratch: usize, output: usize },
}

/// One physical allocation of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedSlot {
    pub size: usize,
    pub alignment: usize,
    pub role: SlotRole,
}

/// An aliasing rule that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedAlias {
    pub output: usize,
    pub scratch: usize,
    pub slot: usize,
}

/// Why an aliasing rule was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasRejection {
    /// Aliasing is turned off in the plan options.
    Disabled,
    /// The scratch buffer is live for the whole call.
    NotAliasable,
    /// The scratch buffer is still live when the output is produced.
    LifetimeOverlap { last_use: u32, produced_at: u32 },
    /// The scratch buffer is smaller than the output.
    TooSmall { scratch_size: usize, output_size: usize },
    /// The scratch alignment does not satisfy the output alignment.
    Misaligned { scratch_alignment: usize, output_alignment: usize },
    /// Another output already took this scratch slot, or the output is already placed.
    AlreadyTaken,
}

impl fmt::Display for AliasRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("aliasing disabled"),
            Self::NotAliasable => f.write_str("scratch buffer is not aliasable"),
            Self::LifetimeOverlap { last_use, produced_at } => {
                write!(f, "scratch live until phase {last_use}, output produced at {produced_at}")
            }
            Self::TooSmall { scratch_size, output_size } => {
                write!(f, "scratch has {scratch_size} bytes, output needs {output_size}")
            }
            Self::Misaligned { scratch_alignment, output_alignment } => {
                write!(f, "scratch aligned to {scratch_alignment}, output needs {output_alignment}")
            }
            Self::AlreadyTaken => f.write_str("slot already placed"),
        }
    }
}

/// A rule that was declared but not applied for this invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectedAlias {
    pub rule: AliasRule,
    pub reason: AliasRejection,
}

/// Result of memory planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPlan {
    slots: Vec<PlannedSlot>,
    outputs: Vec<usize>,
    scratch: Vec<usize>,
    output_shapes: Vec<Shape>,
    dims: Vec<i64>,
    aliases: Vec<AppliedAlias>,
    rejected: Vec<RejectedAlias>,
    peak_bytes: usize,
    unaliased_bytes: usize,
}

impl BufferPlan {
    /// Physical allocations, in allocation order.
    pub fn slots(&self) -> &[PlannedSlot] {
        &self.slots
    }

    /// Slot index holding output `i`.
    pub fn output_slot(&self, i: usize) -> usize {
        self.outputs[i]
    }

    /// Slot index holding scratch buffer `j`.
    pub fn scratch_slot(&self, j: usize) -> usize {
        self.scratch[j]
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn num_scratch(&self) -> usize {
        self.scratch.len()
    }

    /// Concrete shape of output `i`.
    pub fn output_shape(&self, i: usize) -> &[usize] {
        &self.output_shapes[i]
    }

    /// Bound values of every descriptor symbol, in `SignatureDescriptor::symbols` order.
    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    pub fn aliases(&self) -> &[AppliedAlias] {
        &self.aliases
    }

    pub fn rejected(&self) -> &[RejectedAlias] {
        &self.rejected
    }

    /// Bytes allocated by this plan.
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }

    /// Bytes that would be allocated without any aliasing.
    pub fn unaliased_bytes(&self) -> usize {
        self.unaliased_bytes
    }
}

// ============================================================================
// RESOLUTION
// ============================================================================

fn lookup_symbol(bound: &BoundDims, buffer: &str, symbol: &str) -> Result<usize> {
    bound.get(symbol).context(UnresolvedShapeSnafu { buffer, symbol })
}

fn overflow(buffer: &str) -> crate::Error {
    InvalidDescriptorSnafu { reason: format!("size of '{buffer}' overflows") }.build()
}

/// Concrete shape of `spec` under `bound`.
pub fn resolve_shape(buffer: &str, spec: &TensorSpec, bound: &BoundDims) -> Result<Shape> {
    spec.dims
        .iter()
        .map(|dim| match dim {
            Dim::Fixed(n) => Ok(*n),
            Dim::Symbol(symbol) => lookup_symbol(bound, buffer, symbol),
            Dim::Dynamic => UnresolvedShapeSnafu { buffer, symbol: "?" }.fail(),
        })
        .collect()
}

/// Concrete byte size of a scratch request under `bound`.
pub fn resolve_size(request: &BufferRequest, bound: &BoundDims) -> Result<usize> {
    match &request.size {
        SizeExpr::Bytes(n) => Ok(*n),
        SizeExpr::Scaled { bytes_per_unit, dims } => dims.iter().try_fold(*bytes_per_unit, |acc, symbol| {
            let value = lookup_symbol(bound, &request.name, symbol)?;
            acc.checked_mul(value).ok_or_else(|| overflow(&request.name))
        }),
    }
}

fn output_bytes(buffer: &str, spec: &TensorSpec, shape: &[usize]) -> Result<usize> {
    shape.iter().try_fold(spec.dtype.bytes(), |acc, &n| acc.checked_mul(n)).ok_or_else(|| overflow(buffer))
}

fn checked_total(sizes: impl IntoIterator<Item = usize>) -> Result<usize> {
    sizes.into_iter().try_fold(0usize, |acc, n| acc.checked_add(n)).ok_or_else(|| overflow("memory plan"))
}

/// Allocation alignment for an output: its declared alignment, at least the element width.
pub fn output_alignment(spec: &TensorSpec) -> usize {
    spec.layout.alignment.max(spec.dtype.bytes())
}

// ============================================================================
// ALIASING
// ============================================================================

/// The aliasing rule: may output storage of `output_size` bytes with
/// `output_alignment` reuse `scratch` (resolved to `scratch_size` bytes)?
pub fn check_alias(
    rule: &AliasRule,
    scratch: &BufferRequest,
    scratch_size: usize,
    output_size: usize,
    output_alignment: usize,
) -> std::result::Result<(), AliasRejection> {
    let Lifetime::Aliasable { last_use } = scratch.lifetime else {
        return Err(AliasRejection::NotAliasable);
    };
    if last_use > rule.produced_at {
        return Err(AliasRejection::LifetimeOverlap { last_use, produced_at: rule.produced_at });
    }
    if scratch_size < output_size {
        return Err(AliasRejection::TooSmall { scratch_size, output_size });
    }
    if scratch.alignment % output_alignment != 0 {
        return Err(AliasRejection::Misaligned { scratch_alignment: scratch.alignment, output_alignment });
    }
    Ok(())
}

// ============================================================================
// LAYOUT
// ============================================================================

/// Plan the buffers of one invocation.
pub fn layout(descriptor: &SignatureDescriptor, bound: &BoundDims, options: PlanOptions) -> Result<BufferPlan> {
    let output_names: Vec<String> = (0..descriptor.outputs.len()).map(|i| format!("output {i}")).collect();

    // Resolve everything before deciding on any placement.
    let output_shapes = descriptor
        .outputs
        .iter()
        .zip(&output_names)
        .map(|(spec, name)| resolve_shape(name, spec, bound))
        .collect::<Result<Vec<_>>>()?;
    let output_sizes = descriptor
        .outputs
        .iter()
        .zip(&output_shapes)
        .zip(&output_names)
        .map(|((spec, shape), name)| output_bytes(name, spec, shape))
        .collect::<Result<Vec<_>>>()?;
    let scratch_sizes = descriptor.scratch.iter().map(|r| resolve_size(r, bound)).collect::<Result<Vec<_>>>()?;

    let dims = descriptor
        .symbols()
        .into_iter()
        .map(|symbol| lookup_symbol(bound, "entry point arguments", symbol).map(|v| v as i64))
        .collect::<Result<Vec<_>>>()?;

    let mut slots: Vec<PlannedSlot> = descriptor
        .scratch
        .iter()
        .zip(&scratch_sizes)
        .enumerate()
        .map(|(j, (request, &size))| PlannedSlot { size, alignment: request.alignment, role: SlotRole::Scratch(j) })
        .collect();
    let scratch: Vec<usize> = (0..descriptor.scratch.len()).collect();
    let mut outputs: Vec<Option<usize>> = vec![None; descriptor.outputs.len()];
    let mut aliases = Vec::new();
    let mut rejected = Vec::new();

    for rule in &descriptor.aliases {
        let (Some(request), Some(spec)) = (descriptor.scratch.get(rule.scratch), descriptor.outputs.get(rule.output))
        else {
            return InvalidDescriptorSnafu { reason: format!("alias {rule:?} names a missing slot") }.fail();
        };

        let decision = if !options.enable_aliasing {
            Err(AliasRejection::Disabled)
        } else if outputs[rule.output].is_some() || aliases.iter().any(|a: &AppliedAlias| a.scratch == rule.scratch) {
            Err(AliasRejection::AlreadyTaken)
        } else {
            check_alias(
                rule,
                request,
                scratch_sizes[rule.scratch],
                output_sizes[rule.output],
                output_alignment(spec),
            )
        };

        match decision {
            Ok(()) => {
                let slot = scratch[rule.scratch];
                slots[slot].role = SlotRole::Shared { scratch: rule.scratch, output: rule.output };
                outputs[rule.output] = Some(slot);
                aliases.push(AppliedAlias { output: rule.output, scratch: rule.scratch, slot });
                trace!(output = rule.output, scratch = %request.name, slot, "alias applied");
            }
            Err(reason) => {
                trace!(output = rule.output, scratch = %request.name, %reason, "alias rejected");
                rejected.push(RejectedAlias { rule: *rule, reason });
            }
        }
    }

    let outputs: Vec<usize> = outputs
        .into_iter()
        .enumerate()
        .map(|(i, placed)| {
            placed.unwrap_or_else(|| {
                let spec = &descriptor.outputs[i];
                slots.push(PlannedSlot {
                    size: output_sizes[i],
                    alignment: output_alignment(spec),
                    role: SlotRole::Output(i),
                });
                slots.len() - 1
            })
        })
        .collect();

    let unaliased_bytes = checked_total(output_sizes.iter().chain(&scratch_sizes).copied())?;
    let peak_bytes = checked_total(slots.iter().map(|s| s.size))?;
    let plan =
        BufferPlan { slots, outputs, scratch, output_shapes, dims, aliases, rejected, peak_bytes, unaliased_bytes };

    debug_assert!(plan.peak_bytes() <= plan.unaliased_bytes());

    debug!(
        slots = plan.slots.len(),
        peak_bytes = plan.peak_bytes(),
        unaliased_bytes = plan.unaliased_bytes,
        aliases = plan.aliases.len(),
        rejected = plan.rejected.len(),
        "memory plan complete"
    );

    Ok(plan)
}
