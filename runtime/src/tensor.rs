//! Tensors crossing the compiled-function boundary.
//!
//! Inputs are borrowed [`TensorView`]s over caller memory; the runtime never
//! copies or repacks them. Outputs are owned [`Tensor`]s whose storage is the
//! buffer the compiled function wrote into.

use kiln_device::BufferAllocation;
use kiln_dtype::{DType, HasDType};
use smallvec::SmallVec;
use snafu::{OptionExt, ensure};

use crate::error::{InvalidTensorSnafu, Result};

pub type Shape = SmallVec<[usize; 4]>;

/// Row-major strides (in elements) for `shape`.
pub fn contiguous_strides(shape: &[usize]) -> Shape {
    let mut strides: Shape = smallvec::smallvec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1].max(1);
    }
    strides
}

/// A borrowed caller tensor.
#[derive(Debug, Clone)]
pub struct TensorView<'a> {
    dtype: DType,
    shape: Shape,
    strides: Shape,
    data: &'a [u8],
}

impl<'a> TensorView<'a> {
    /// Dense row-major view. `data` must hold exactly `numel * dtype.bytes()` bytes.
    pub fn new(dtype: DType, shape: &[usize], data: &'a [u8]) -> Result<Self> {
        let expected = shape
            .iter()
            .try_fold(dtype.bytes(), |acc, &n| acc.checked_mul(n))
            .with_context(|| InvalidTensorSnafu { reason: format!("{dtype}{shape:?} overflows the address space") })?;
        ensure!(
            data.len() == expected,
            InvalidTensorSnafu {
                reason: format!("{dtype}{shape:?} needs {expected} bytes, got {}", data.len())
            }
        );
        Ok(Self { dtype, shape: Shape::from_slice(shape), strides: contiguous_strides(shape), data })
    }

    /// View with explicit element strides. `data` must cover the furthest element.
    pub fn strided(dtype: DType, shape: &[usize], strides: &[usize], data: &'a [u8]) -> Result<Self> {
        ensure!(
            shape.len() == strides.len(),
            InvalidTensorSnafu { reason: format!("rank {} shape with {} strides", shape.len(), strides.len()) }
        );

        let extent = if shape.contains(&0) {
            Some(0)
        } else {
            shape
                .iter()
                .zip(strides)
                .try_fold(0usize, |last, (n, s)| (n - 1).checked_mul(*s).and_then(|step| last.checked_add(step)))
                .and_then(|last| last.checked_add(1))
                .and_then(|elements| elements.checked_mul(dtype.bytes()))
        };
        let extent = extent.with_context(|| InvalidTensorSnafu {
            reason: format!("strided view {shape:?} / {strides:?} overflows the address space"),
        })?;
        ensure!(
            data.len() >= extent,
            InvalidTensorSnafu { reason: format!("strided view reaches byte {extent}, data has {}", data.len()) }
        );

        Ok(Self { dtype, shape: Shape::from_slice(shape), strides: Shape::from_slice(strides), data })
    }

    /// Dense view over a typed slice.
    pub fn from_slice<T: HasDType>(shape: &[usize], values: &'a [T]) -> Result<Self> {
        // SAFETY: `HasDType` is only implemented for padding-free scalars, so every
        // byte of `values` is initialized and the length covers exactly the slice.
        let bytes =
            unsafe { std::slice::from_raw_parts(values.as_ptr().cast::<u8>(), std::mem::size_of_val(values)) };
        Self::new(T::DTYPE, shape, bytes)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    /// Dense row-major, ignoring strides of unit dimensions.
    pub fn is_contiguous(&self) -> bool {
        let expected = contiguous_strides(&self.shape);
        self.shape.iter().zip(&self.strides).zip(&expected).all(|((n, s), e)| *n <= 1 || s == e)
    }
}

/// An output produced by a compiled function.
#[derive(Debug)]
pub struct Tensor {
    dtype: DType,
    shape: Shape,
    buffer: BufferAllocation,
}

impl Tensor {
    pub(crate) fn new(dtype: DType, shape: Shape, buffer: BufferAllocation) -> Self {
        Self { dtype, shape, buffer }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Exactly `numel * dtype.bytes()` bytes; the underlying buffer may be larger
    /// when the output was placed in a scratch slot.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer.as_slice()[..self.numel() * self.dtype.bytes()]
    }

    pub fn buffer(&self) -> &BufferAllocation {
        &self.buffer
    }

    pub fn into_buffer(self) -> BufferAllocation {
        self.buffer
    }

    /// Decode the elements. `T` must match the tensor's dtype.
    pub fn to_vec<T: HasDType>(&self) -> Result<Vec<T>> {
        ensure!(
            T::DTYPE == self.dtype,
            InvalidTensorSnafu { reason: format!("cannot read {} tensor as {}", self.dtype, T::DTYPE) }
        );
        Ok(self.as_bytes().chunks_exact(self.dtype.bytes()).map(T::read_ne).collect())
    }

    /// Borrow the output as an input view, e.g. to feed the next compiled function.
    pub fn view(&self) -> TensorView<'_> {
        TensorView {
            dtype: self.dtype,
            shape: self.shape.clone(),
            strides: contiguous_strides(&self.shape),
            data: self.as_bytes(),
        }
    }
}
