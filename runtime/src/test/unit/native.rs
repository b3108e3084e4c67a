use std::sync::Arc;

use crate::dispatch::Runtime;
use kiln_dtype::DType;

use crate::entry::{CallFrame, EntryPoint, InputLayouts, KernelArg};
use crate::error::Error;
use crate::native::{NativeFunction, NativeLibrary};
use crate::signature::{FunctionKey, SignatureDescriptor, TensorSpec};
use crate::tensor::TensorView;
use crate::test::helpers::*;

/// `out[i] = a[i] + b[i]` over `dims[0]` float32 elements.
unsafe extern "C" fn native_add(
    args: *const *mut u8,
    sizes: *const usize,
    nargs: usize,
    dims: *const i64,
    ndims: usize,
    _shapes: *const i64,
    _strides: *const i64,
    _nlayout: usize,
) -> i32 {
    if nargs != 3 || ndims != 1 {
        return 1;
    }
    unsafe {
        let n = *dims as usize;
        if *sizes.add(2) != n * 4 {
            return 2;
        }
        let a = std::slice::from_raw_parts(*args as *const f32, n);
        let b = std::slice::from_raw_parts(*args.add(1) as *const f32, n);
        let out = std::slice::from_raw_parts_mut(*args.add(2) as *mut f32, n);
        for i in 0..n {
            out[i] = a[i] + b[i];
        }
    }
    0
}

unsafe extern "C" fn native_reject(
    _args: *const *mut u8,
    _sizes: *const usize,
    _nargs: usize,
    _dims: *const i64,
    _ndims: usize,
    _shapes: *const i64,
    _strides: *const i64,
    _nlayout: usize,
) -> i32 {
    7
}

/// Copies a strided `float32[2, 2]` input into a dense output in logical order.
unsafe extern "C" fn native_densify(
    args: *const *mut u8,
    _sizes: *const usize,
    nargs: usize,
    _dims: *const i64,
    _ndims: usize,
    shapes: *const i64,
    strides: *const i64,
    nlayout: usize,
) -> i32 {
    if nargs != 2 || nlayout != 2 {
        return 1;
    }
    unsafe {
        let (rows, cols) = (*shapes as usize, *shapes.add(1) as usize);
        let (row_stride, col_stride) = (*strides as usize, *strides.add(1) as usize);
        let input = *args as *const f32;
        let out = std::slice::from_raw_parts_mut(*args.add(1) as *mut f32, rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                out[r * cols + c] = *input.add(r * row_stride + c * col_stride);
            }
        }
    }
    0
}

#[test]
fn test_native_function_through_runtime() {
    let runtime = Runtime::new(fresh_registry());
    let key = FunctionKey::for_descriptor("native_add", &add_descriptor());
    runtime.register(key.clone(), add_descriptor(), Arc::new(NativeFunction::from_raw("native_add", native_add))).unwrap();

    let a = [1.0f32, 2.0, 3.0, 4.0];
    let b = [4.0f32, 3.0, 2.0, 1.0];
    let inputs = [TensorView::from_slice(&[4], &a).unwrap(), TensorView::from_slice(&[4], &b).unwrap()];

    let outputs = runtime.lookup_and_invoke(&key, &inputs).unwrap();
    assert_eq!(outputs[0].to_vec::<f32>().unwrap(), [5.0; 4]);
}

#[test]
fn test_native_nonzero_return_is_failure() {
    let allocator = CountingAllocator::new();
    let runtime = Runtime::new(fresh_registry()).with_allocator(allocator.clone());
    let key = FunctionKey::new("native_reject", 1);
    runtime
        .register(key.clone(), add_descriptor(), Arc::new(NativeFunction::from_raw("native_reject", native_reject)))
        .unwrap();

    let a = [0.0f32; 2];
    let inputs = [TensorView::from_slice(&[2], &a).unwrap(), TensorView::from_slice(&[2], &a).unwrap()];

    let err = runtime.lookup_and_invoke(&key, &inputs).unwrap_err();
    assert!(matches!(err, Error::ExecutionFailed { code: 7, .. }), "got {err}");
    assert_eq!(allocator.live(), 0);
}

#[test]
fn test_native_call_passes_frame_verbatim() {
    let func = NativeFunction::from_raw("native_add", native_add);
    assert_eq!(func.name(), "native_add");

    let mut a = [1.0f32, 1.0];
    let mut b = [2.0f32, 2.0];
    let mut out = [0.0f32; 2];
    let args = [
        KernelArg { ptr: a.as_mut_ptr().cast(), len: 8 },
        KernelArg { ptr: b.as_mut_ptr().cast(), len: 8 },
        KernelArg { ptr: out.as_mut_ptr().cast(), len: 8 },
    ];
    let dims = [2i64];
    let layouts = InputLayouts::from_views(&[
        TensorView::from_slice(&[2], &[0.0f32; 2]).unwrap(),
        TensorView::from_slice(&[2], &[0.0f32; 2]).unwrap(),
    ]);

    // SAFETY: every pointer covers its declared length for the whole call.
    unsafe { func.call(&CallFrame::new(&args, 1, &dims, &layouts)) }.unwrap();
    assert_eq!(out, [3.0, 3.0]);

    let short = [2i64, 9];
    // SAFETY: as above.
    let fault = unsafe { func.call(&CallFrame::new(&args, 1, &short, &layouts)) }.unwrap_err();
    assert_eq!(fault.code, 1);
}

#[test]
fn test_native_function_sees_input_strides() {
    let square = TensorSpec::new(DType::Float32, [2usize, 2]);
    let descriptor = SignatureDescriptor::new(vec![square.clone().strided()], vec![square]);
    let runtime = Runtime::new(fresh_registry());
    let key = FunctionKey::for_descriptor("native_densify", &descriptor);
    let entry = Arc::new(NativeFunction::from_raw("native_densify", native_densify));
    runtime.register(key.clone(), descriptor, entry).unwrap();

    let data = [1.0f32, 2.0, 3.0, 4.0];
    let bytes = TensorView::from_slice(&[4], &data).unwrap().data();

    let row_major = TensorView::strided(DType::Float32, &[2, 2], &[2, 1], bytes).unwrap();
    let outputs = runtime.lookup_and_invoke(&key, &[row_major]).unwrap();
    assert_eq!(outputs[0].to_vec::<f32>().unwrap(), [1.0, 2.0, 3.0, 4.0]);

    let transposed = TensorView::strided(DType::Float32, &[2, 2], &[1, 2], bytes).unwrap();
    let outputs = runtime.lookup_and_invoke(&key, &[transposed]).unwrap();
    assert_eq!(outputs[0].to_vec::<f32>().unwrap(), [1.0, 3.0, 2.0, 4.0]);
}

#[test]
fn test_missing_library() {
    let err = NativeLibrary::open("/nonexistent/libkiln_missing.so").unwrap_err();
    assert!(matches!(err, Error::LibraryLoad { .. }), "got {err}");
}
