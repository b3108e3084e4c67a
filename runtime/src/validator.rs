//! Compatibility checks between caller tensors and a descriptor.
//!
//! Validation runs before any buffer is allocated. It never coerces or repacks:
//! an input is either usable by the compiled function as-is or rejected.

use smallvec::SmallVec;
use snafu::ensure;
use tracing::trace;

use crate::error::{ArityMismatchSnafu, DTypeMismatchSnafu, LayoutMismatchSnafu, Result, ShapeConflictSnafu};
use crate::signature::{Dim, SignatureDescriptor, TensorSpec};
use crate::tensor::TensorView;

/// Concrete values of symbolic dimensions for one invocation, in binding order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundDims {
    values: SmallVec<[(String, usize); 4]>,
}

impl BoundDims {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<usize> {
        self.values.iter().find(|(name, _)| name == symbol).map(|(_, v)| *v)
    }

    /// Bind `symbol` to `value`. If already bound to a different value, returns
    /// that value and leaves the table unchanged.
    pub fn bind(&mut self, symbol: &str, value: usize) -> Result<(), usize> {
        match self.get(symbol) {
            Some(bound) if bound != value => Err(bound),
            Some(_) => Ok(()),
            None => {
                self.values.push((symbol.to_string(), value));
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.values.iter().map(|(name, v)| (name.as_str(), *v))
    }
}

impl<S: Into<String>> FromIterator<(S, usize)> for BoundDims {
    fn from_iter<I: IntoIterator<Item = (S, usize)>>(iter: I) -> Self {
        Self { values: iter.into_iter().map(|(name, v)| (name.into(), v)).collect() }
    }
}

/// Check every input against `descriptor` and collect the bound dimensions.
pub fn check(descriptor: &SignatureDescriptor, inputs: &[TensorView<'_>]) -> Result<BoundDims> {
    ensure!(
        inputs.len() == descriptor.inputs.len(),
        ArityMismatchSnafu { expected: descriptor.inputs.len(), actual: inputs.len() }
    );

    let mut bound = BoundDims::new();
    for (index, (spec, view)) in descriptor.inputs.iter().zip(inputs).enumerate() {
        check_input(index, spec, view, &mut bound)?;
    }
    Ok(bound)
}

/// Whether `inputs` would pass [`check`].
pub fn accepts(descriptor: &SignatureDescriptor, inputs: &[TensorView<'_>]) -> bool {
    check(descriptor, inputs).is_ok()
}

/// Check one input, binding its symbolic dimensions into `bound`.
pub fn check_input(index: usize, spec: &TensorSpec, view: &TensorView<'_>, bound: &mut BoundDims) -> Result<()> {
    ensure!(
        view.dtype() == spec.dtype,
        DTypeMismatchSnafu { input: index, expected: spec.dtype, actual: view.dtype() }
    );

    ensure!(
        view.rank() == spec.rank(),
        LayoutMismatchSnafu { input: index, reason: format!("expected rank {}, got {}", spec.rank(), view.rank()) }
    );

    for (axis, (dim, &actual)) in spec.dims.iter().zip(view.shape()).enumerate() {
        match dim {
            Dim::Fixed(expected) => ensure!(
                *expected == actual,
                LayoutMismatchSnafu {
                    input: index,
                    reason: format!("dimension {axis} must be {expected}, got {actual} (expected {spec})"),
                }
            ),
            Dim::Symbol(symbol) => {
                if let Err(previous) = bound.bind(symbol, actual) {
                    return ShapeConflictSnafu { symbol: symbol.clone(), bound: previous, input: index, actual }.fail();
                }
                trace!(input = index, axis, symbol = %symbol, value = actual, "dimension bound");
            }
            Dim::Dynamic => {}
        }
    }

    if spec.layout.contiguous {
        ensure!(
            view.is_contiguous(),
            LayoutMismatchSnafu {
                input: index,
                reason: format!("expected contiguous layout, got strides {:?} for shape {:?}", view.strides(), view.shape()),
            }
        );
    }

    let alignment = spec.layout.alignment.max(1);
    ensure!(
        (view.as_ptr() as usize) % alignment == 0,
        LayoutMismatchSnafu { input: index, reason: format!("data pointer is not {alignment}-byte aligned") }
    );

    Ok(())
}
