//! Per-invocation execution context.
//!
//! An [`ExecutionContext`] binds one call's input tensors and freshly acquired
//! buffers to a registered function's contract and performs the call.
//!
//! ```text
//!  Created ──prepare()──▶ Prepared ──invoke()──▶ Invoked ──▶ Completed
//!     │                                            │
//!     └──────────── (error) ──▶ Failed ◀───────────┘
//! ```
//!
//! Calling `prepare` or `invoke` out of order is a programming error and panics.
//! Buffers are owned by the context until outputs are handed back; everything
//! else is released when the call finishes, fails, or the context is dropped.
//!
//! # Example
//!
//! ```ignore
//! let entry = registry.lookup(&key)?;
//! let mut ctx = ExecutionContext::new(entry, kiln_device::cpu(), PlanOptions::default());
//! ctx.prepare(&[input])?;
//! let outputs = ctx.invoke()?;
//! ```

use std::sync::Arc;

use kiln_device::{Allocator, BufferAllocation, BufferOptions};
use smallvec::SmallVec;
use snafu::ResultExt;
use tracing::debug;

use crate::entry::{CallFrame, InputLayouts, KernelArg};
use crate::error::{DeviceSnafu, ExecutionFailedSnafu, Result};
use crate::planner::{self, BufferPlan, PlanOptions};
use crate::registry::RegistryEntry;
use crate::tensor::{Tensor, TensorView};
use crate::validator::{self, BoundDims};

/// Lifecycle state of an [`ExecutionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    Prepared,
    Invoked,
    Completed,
    Failed,
}

/// One invocation of one registered function. Never shared, never reused.
pub struct ExecutionContext<'a> {
    entry: Arc<RegistryEntry>,
    allocator: Arc<dyn Allocator>,
    options: PlanOptions,
    state: ContextState,
    inputs: SmallVec<[TensorView<'a>; 4]>,
    bound: BoundDims,
    plan: Option<BufferPlan>,
    /// One allocation per plan slot; emptied as outputs are handed out.
    slots: Vec<Option<BufferAllocation>>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(entry: Arc<RegistryEntry>, allocator: Arc<dyn Allocator>, options: PlanOptions) -> Self {
        Self {
            entry,
            allocator,
            options,
            state: ContextState::Created,
            inputs: SmallVec::new(),
            bound: BoundDims::new(),
            plan: None,
            slots: Vec::new(),
        }
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn entry(&self) -> &Arc<RegistryEntry> {
        &self.entry
    }

    /// Dimensions bound during `prepare`.
    pub fn bound_dims(&self) -> &BoundDims {
        &self.bound
    }

    /// Buffer plan computed during `prepare`.
    pub fn plan(&self) -> Option<&BufferPlan> {
        self.plan.as_ref()
    }

    /// Buffers currently owned by the context.
    pub fn buffers(&self) -> impl Iterator<Item = &BufferAllocation> {
        self.slots.iter().flatten()
    }

    /// Validate `inputs`, plan buffers and acquire them.
    ///
    /// Validation and planning finish before the first buffer is acquired. On
    /// failure every acquired buffer is released and the context is `Failed`.
    ///
    /// # Panics
    ///
    /// If the context is not in the `Created` state.
    pub fn prepare(&mut self, inputs: &[TensorView<'a>]) -> Result<()> {
        assert_eq!(
            self.state,
            ContextState::Created,
            "prepare() on {} requires a fresh context",
            self.entry.key()
        );

        match self.try_prepare(inputs) {
            Ok(()) => {
                self.state = ContextState::Prepared;
                Ok(())
            }
            Err(e) => {
                self.slots.clear();
                self.state = ContextState::Failed;
                debug!(function.key = %self.entry.key(), error = %e, "prepare failed");
                Err(e)
            }
        }
    }

    fn try_prepare(&mut self, inputs: &[TensorView<'a>]) -> Result<()> {
        let descriptor = Arc::clone(self.entry.descriptor());

        let bound = validator::check(&descriptor, inputs)?;
        let plan = planner::layout(&descriptor, &bound, self.options)?;

        self.inputs = inputs.iter().cloned().collect();
        self.bound = bound;
        for slot in plan.slots() {
            let options = BufferOptions { alignment: slot.alignment, zero_init: false };
            let buffer =
                BufferAllocation::acquire(Arc::clone(&self.allocator), slot.size, &options).context(DeviceSnafu)?;
            self.slots.push(Some(buffer));
        }
        self.plan = Some(plan);
        Ok(())
    }

    /// Call the compiled function once and hand back its outputs.
    ///
    /// # Panics
    ///
    /// If the context is not `Prepared`: before a successful `prepare`, after a
    /// failed one, or on a second call.
    pub fn invoke(&mut self) -> Result<Vec<Tensor>> {
        assert_eq!(
            self.state,
            ContextState::Prepared,
            "invoke() on {} requires a prepared context",
            self.entry.key()
        );
        self.state = ContextState::Invoked;

        let Some(plan) = self.plan.take() else { unreachable!("prepared context without a plan") };
        let descriptor = Arc::clone(self.entry.descriptor());

        // Inputs are passed as `*mut u8` for a uniform convention; entry points
        // must not write through them.
        let mut args: SmallVec<[KernelArg; 8]> = self
            .inputs
            .iter()
            .map(|view| KernelArg { ptr: view.as_ptr().cast_mut(), len: view.data().len() })
            .collect();
        let slot_indices = (0..plan.num_outputs()).map(|i| plan.output_slot(i));
        let scratch_indices = (0..plan.num_scratch()).map(|j| plan.scratch_slot(j));
        for slot in slot_indices.chain(scratch_indices) {
            let buffer = self.slots[slot].as_mut().unwrap_or_else(|| unreachable!("slot {slot} released early"));
            args.push(KernelArg { ptr: buffer.as_mut_ptr(), len: buffer.size() });
        }

        let layouts = InputLayouts::from_views(&self.inputs);
        let frame = CallFrame::new(&args, plan.num_outputs(), plan.dims(), &layouts);

        debug!(
            function.key = %self.entry.key(),
            function.entry = self.entry.entry_point().name(),
            args = args.len(),
            dims = ?plan.dims(),
            "invoking compiled function"
        );

        // SAFETY: input pointers borrow caller data for 'a; every other pointer
        // belongs to a slot owned by `self`, sized and aligned by the plan, and the
        // slots are not touched until the call returns. The argument order matches
        // the descriptor the entry was registered with.
        let result = unsafe { self.entry.entry_point().call(&frame) };

        match result {
            Ok(()) => {
                let outputs = descriptor
                    .outputs
                    .iter()
                    .enumerate()
                    .map(|(i, spec)| {
                        let slot = plan.output_slot(i);
                        let buffer =
                            self.slots[slot].take().unwrap_or_else(|| unreachable!("output slot {slot} taken twice"));
                        Tensor::new(spec.dtype, plan.output_shape(i).into(), buffer)
                    })
                    .collect();
                self.slots.clear();
                self.state = ContextState::Completed;
                self.plan = Some(plan);
                Ok(outputs)
            }
            Err(fault) => {
                self.slots.clear();
                self.state = ContextState::Failed;
                self.plan = Some(plan);
                debug!(function.key = %self.entry.key(), %fault, "compiled function failed");
                ExecutionFailedSnafu { function: self.entry.key().to_string(), code: fault.code, message: fault.message }
                    .fail()
            }
        }
    }
}

impl std::fmt::Debug for ExecutionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("function", self.entry.key())
            .field("state", &self.state)
            .field("bound", &self.bound)
            .field("buffers", &self.slots.iter().flatten().count())
            .finish()
    }
}
