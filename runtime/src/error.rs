//! Error types for registration and invocation.

use kiln_dtype::DType;
use snafu::Snafu;

use crate::signature::FunctionKey;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the registry, the validator, the planner and the context.
///
/// Registration errors only affect the offending registration. Everything else is
/// per invocation and is returned to the caller as-is.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A function with the same name and signature hash is already registered.
    #[snafu(display("function {key} is already registered"))]
    DuplicateKey { key: FunctionKey },

    /// No function is registered under the key.
    #[snafu(display("function {key} is not registered"))]
    NotFound { key: FunctionKey },

    /// Registration attempted after the registry was frozen.
    #[snafu(display("cannot register {key}: registry is frozen"))]
    RegistryFrozen { key: FunctionKey },

    /// The descriptor was produced for a different descriptor format.
    #[snafu(display("signature format version {actual} is not supported (expected {expected})"))]
    IncompatibleSignatureVersion { expected: u32, actual: u32 },

    /// The descriptor is internally inconsistent.
    #[snafu(display("invalid descriptor: {reason}"))]
    InvalidDescriptor { reason: String },

    /// The key's hash does not match the descriptor it is registered with.
    #[snafu(display("signature hash of {key} does not match descriptor hash {actual:#x}"))]
    SignatureHashMismatch { key: FunctionKey, actual: u64 },

    /// Wrong number of input tensors.
    #[snafu(display("expected {expected} inputs, got {actual}"))]
    ArityMismatch { expected: usize, actual: usize },

    /// An input has a different element type than declared.
    #[snafu(display("input {input}: expected dtype {expected}, got {actual}"))]
    DTypeMismatch { input: usize, expected: DType, actual: DType },

    /// A symbolic dimension was bound to two different values.
    #[snafu(display("dimension '{symbol}' bound to {bound} but input {input} has {actual}"))]
    ShapeConflict { symbol: String, bound: usize, input: usize, actual: usize },

    /// An input's rank, fixed extent, strides or alignment does not match.
    #[snafu(display("input {input}: {reason}"))]
    LayoutMismatch { input: usize, reason: String },

    /// A buffer size depends on a symbol that was never bound.
    #[snafu(display("size of '{buffer}' depends on unbound dimension '{symbol}'"))]
    UnresolvedShape { buffer: String, symbol: String },

    /// The compiled function signaled a failure.
    #[snafu(display("{function} failed with code {code}: {message}"))]
    ExecutionFailed { function: String, code: i32, message: String },

    /// No registered variant of a function accepts the given inputs.
    #[snafu(display("no variant of '{name}' accepts the given inputs ({candidates} candidates)"))]
    NoMatchingVariant { name: String, candidates: usize },

    /// A caller tensor is malformed (data does not cover its shape).
    #[snafu(display("invalid tensor: {reason}"))]
    InvalidTensor { reason: String },

    /// A shared library could not be loaded.
    #[snafu(display("failed to load library {path}: {reason}"))]
    LibraryLoad { path: String, reason: String },

    /// A symbol could not be resolved in a loaded library.
    #[snafu(display("symbol '{symbol}' not found: {reason}"))]
    SymbolNotFound { symbol: String, reason: String },

    /// Buffer allocation failed.
    #[snafu(display("device error: {source}"))]
    Device { source: kiln_device::Error },
}
