//! The calling convention shared by every compiled function.
//!
//! An entry point receives one flat, ordered argument list: every input, then
//! every output, then every scratch buffer, each as a pointer plus a byte length.
//! Bound symbolic dimensions follow as `i64` values in
//! [`SignatureDescriptor::symbols`](crate::SignatureDescriptor::symbols) order.
//! Every input also carries its concrete shape and element strides, so a
//! function that accepts strided inputs can tell a transposed view from a dense
//! one over the same bytes.

use std::fmt;

use smallvec::SmallVec;

use crate::tensor::TensorView;

/// One buffer argument.
#[derive(Debug, Clone, Copy)]
pub struct KernelArg {
    pub ptr: *mut u8,
    pub len: usize,
}

/// Shapes and element strides of every input, flattened in input order.
///
/// Input `i` owns `rank(i)` consecutive entries of [`shapes`](Self::shapes) and
/// of [`strides`](Self::strides).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputLayouts {
    offsets: SmallVec<[usize; 5]>,
    shapes: SmallVec<[i64; 16]>,
    strides: SmallVec<[i64; 16]>,
}

impl InputLayouts {
    pub fn new() -> Self {
        Self { offsets: smallvec::smallvec![0], shapes: SmallVec::new(), strides: SmallVec::new() }
    }

    pub fn from_views(views: &[TensorView<'_>]) -> Self {
        let mut layouts = Self::new();
        for view in views {
            layouts.push(view.shape(), view.strides());
        }
        layouts
    }

    /// Append one input.
    pub fn push(&mut self, shape: &[usize], strides: &[usize]) {
        debug_assert_eq!(shape.len(), strides.len());
        self.shapes.extend(shape.iter().map(|&n| n as i64));
        self.strides.extend(strides.iter().map(|&s| s as i64));
        self.offsets.push(self.shapes.len());
    }

    /// Number of inputs described.
    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self, i: usize) -> &[i64] {
        &self.shapes[self.offsets[i]..self.offsets[i + 1]]
    }

    pub fn strides_of(&self, i: usize) -> &[i64] {
        &self.strides[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Every input's extents, concatenated.
    pub fn shapes(&self) -> &[i64] {
        &self.shapes
    }

    /// Every input's element strides, concatenated.
    pub fn strides(&self) -> &[i64] {
        &self.strides
    }
}

impl Default for InputLayouts {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments of one invocation, in calling-convention order.
#[derive(Debug)]
pub struct CallFrame<'a> {
    args: &'a [KernelArg],
    num_inputs: usize,
    num_outputs: usize,
    dims: &'a [i64],
    layouts: &'a InputLayouts,
}

impl<'a> CallFrame<'a> {
    pub fn new(args: &'a [KernelArg], num_outputs: usize, dims: &'a [i64], layouts: &'a InputLayouts) -> Self {
        let num_inputs = layouts.len();
        debug_assert!(num_inputs + num_outputs <= args.len());
        Self { args, num_inputs, num_outputs, dims, layouts }
    }

    /// Every argument: inputs, then outputs, then scratch.
    pub fn args(&self) -> &'a [KernelArg] {
        self.args
    }

    pub fn inputs(&self) -> &'a [KernelArg] {
        &self.args[..self.num_inputs]
    }

    pub fn outputs(&self) -> &'a [KernelArg] {
        &self.args[self.num_inputs..self.num_inputs + self.num_outputs]
    }

    pub fn scratch(&self) -> &'a [KernelArg] {
        &self.args[self.num_inputs + self.num_outputs..]
    }

    pub fn dims(&self) -> &'a [i64] {
        self.dims
    }

    pub fn layouts(&self) -> &'a InputLayouts {
        self.layouts
    }

    /// Concrete extents of input `i`.
    pub fn input_shape(&self, i: usize) -> &'a [i64] {
        self.layouts.shape(i)
    }

    /// Element strides of input `i`.
    pub fn input_strides(&self, i: usize) -> &'a [i64] {
        self.layouts.strides_of(i)
    }

    /// Bytes of input `i`.
    ///
    /// # Safety
    ///
    /// Must only be called from inside an entry point while the frame is live.
    pub unsafe fn input(&self, i: usize) -> &'a [u8] {
        let arg = self.inputs()[i];
        unsafe { std::slice::from_raw_parts(arg.ptr, arg.len) }
    }

    /// Bytes of output `i`.
    ///
    /// # Safety
    ///
    /// Must only be called from inside an entry point while the frame is live, and
    /// no other live slice may cover the same storage (an output aliased to a
    /// scratch slot shares its address with that slot).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn output(&self, i: usize) -> &'a mut [u8] {
        let arg = self.outputs()[i];
        unsafe { std::slice::from_raw_parts_mut(arg.ptr, arg.len) }
    }

    /// Bytes of scratch buffer `j`.
    ///
    /// # Safety
    ///
    /// Same as [`CallFrame::output`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn scratch_buffer(&self, j: usize) -> &'a mut [u8] {
        let arg = self.scratch()[j];
        unsafe { std::slice::from_raw_parts_mut(arg.ptr, arg.len) }
    }
}

/// Failure signaled by a compiled function (not a crash).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelFault {
    pub code: i32,
    pub message: String,
}

impl KernelFault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl fmt::Display for KernelFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}

/// An opaque compiled function.
///
/// Entry points are shared by every invocation of their registry entry, possibly
/// from many threads at once, so they must not keep per-call state.
pub trait EntryPoint: Send + Sync {
    /// Run the function once.
    ///
    /// # Safety
    ///
    /// Every argument pointer must be valid for its length for the whole call,
    /// inputs must not be written, and the argument list must match the
    /// descriptor this entry point was registered with.
    unsafe fn call(&self, frame: &CallFrame<'_>) -> Result<(), KernelFault>;

    /// Name for diagnostics.
    fn name(&self) -> &str;
}

/// Entry point backed by a Rust closure.
pub struct FnEntryPoint<F> {
    name: String,
    func: F,
}

impl<F> FnEntryPoint<F>
where
    F: Fn(&CallFrame<'_>) -> Result<(), KernelFault> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self { name: name.into(), func }
    }
}

impl<F> EntryPoint for FnEntryPoint<F>
where
    F: Fn(&CallFrame<'_>) -> Result<(), KernelFault> + Send + Sync,
{
    unsafe fn call(&self, frame: &CallFrame<'_>) -> Result<(), KernelFault> {
        (self.func)(frame)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FnEntryPoint<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnEntryPoint").field("name", &self.name).finish_non_exhaustive()
    }
}
