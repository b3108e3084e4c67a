//! C-ABI entry points, optionally resolved from shared libraries.
//!
//! Native compiled functions follow one signature:
//!
//! ```c
//! int32_t fn(uint8_t **args, const size_t *sizes, size_t nargs,
//!            const int64_t *dims, size_t ndims,
//!            const int64_t *shapes, const int64_t *strides, size_t nlayout);
//! ```
//!
//! `shapes` and `strides` hold every input's extents and element strides,
//! concatenated in input order; input `i` contributes as many entries as its
//! declared rank, and `nlayout` is the total. A non-zero return value is a
//! signaled failure and is reported with that code.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

use crate::entry::{CallFrame, EntryPoint, KernelFault};
use crate::error::{LibraryLoadSnafu, Result, SymbolNotFoundSnafu};

/// Raw native entry point.
pub type NativeFn = unsafe extern "C" fn(
    args: *const *mut u8,
    sizes: *const usize,
    nargs: usize,
    dims: *const i64,
    ndims: usize,
    shapes: *const i64,
    strides: *const i64,
    nlayout: usize,
) -> i32;

/// A native compiled function.
pub struct NativeFunction {
    name: String,
    func: NativeFn,
    /// Keeps the defining library mapped.
    _lib: Option<Arc<libloading::Library>>,
}

impl NativeFunction {
    /// Wrap a function pointer linked into the host binary.
    pub fn from_raw(name: impl Into<String>, func: NativeFn) -> Self {
        Self { name: name.into(), func, _lib: None }
    }
}

impl EntryPoint for NativeFunction {
    unsafe fn call(&self, frame: &CallFrame<'_>) -> Result<(), KernelFault> {
        let ptrs: SmallVec<[*mut u8; 8]> = frame.args().iter().map(|a| a.ptr).collect();
        let sizes: SmallVec<[usize; 8]> = frame.args().iter().map(|a| a.len).collect();
        let dims = frame.dims();
        let layouts = frame.layouts();
        debug_assert_eq!(layouts.shapes().len(), layouts.strides().len());

        let code = unsafe {
            (self.func)(
                ptrs.as_ptr(),
                sizes.as_ptr(),
                ptrs.len(),
                dims.as_ptr(),
                dims.len(),
                layouts.shapes().as_ptr(),
                layouts.strides().as_ptr(),
                layouts.shapes().len(),
            )
        };
        if code == 0 { Ok(()) } else { Err(KernelFault::new(code, format!("{} returned {code}", self.name))) }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction").field("name", &self.name).field("loaded", &self._lib.is_some()).finish()
    }
}

/// A shared library containing compiled functions.
#[derive(Debug, Clone)]
pub struct NativeLibrary {
    lib: Arc<libloading::Library>,
    path: PathBuf,
}

impl NativeLibrary {
    /// Load the library at `path`.
    ///
    /// Loading runs the library's initializers; only load artifacts produced by
    /// the trusted offline compiler.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        // SAFETY: see the function docs; initializers are trusted compiler output.
        let lib = unsafe { libloading::Library::new(path) }
            .map_err(|e| LibraryLoadSnafu { path: path.display().to_string(), reason: e.to_string() }.build())?;

        debug!(library.path = %path.display(), "native library loaded");
        Ok(Self { lib: Arc::new(lib), path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve `symbol` as a [`NativeFn`]. The returned function keeps the
    /// library loaded for as long as it lives.
    pub fn function(&self, symbol: &str) -> Result<NativeFunction> {
        // SAFETY: the symbol is trusted to have the `NativeFn` signature; the copied
        // pointer stays valid because the function holds the library.
        let func: NativeFn = unsafe {
            let sym: libloading::Symbol<'_, NativeFn> = self
                .lib
                .get(symbol.as_bytes())
                .map_err(|e| SymbolNotFoundSnafu { symbol, reason: e.to_string() }.build())?;
            *sym
        };

        debug!(library.path = %self.path.display(), symbol, "native entry point resolved");
        Ok(NativeFunction { name: symbol.to_string(), func, _lib: Some(Arc::clone(&self.lib)) })
    }
}
