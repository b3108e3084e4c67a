//! Runtime for ahead-of-time compiled functions.
//!
//! Compiled functions are opaque entry points produced offline, each shipped
//! with a [`SignatureDescriptor`] that declares its inputs, outputs, scratch
//! buffers and the scratch storage outputs may reuse. This crate registers them,
//! checks caller tensors against their contract, plans and acquires buffers, and
//! performs the call.
//!
//! # Flow
//!
//! ```text
//! FunctionRegistry::lookup(key) ─▶ ExecutionContext::prepare(inputs)
//!                                     ├─ validator::check   (dtype, shape, layout)
//!                                     ├─ planner::layout    (slots, aliasing)
//!                                     └─ buffer acquisition
//!                                  ─▶ ExecutionContext::invoke() ─▶ outputs
//! ```
//!
//! [`Runtime`] wraps this sequence into
//! [`lookup_and_invoke`](Runtime::lookup_and_invoke) and, for functions compiled
//! in several shape-specialized variants, [`select_and_invoke`](Runtime::select_and_invoke).

pub mod config;
pub mod context;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod native;
pub mod planner;
pub mod registry;
pub mod signature;
pub mod tensor;
pub mod validator;


pub use config::RuntimeConfig;
pub use context::{ContextState, ExecutionContext};
pub use dispatch::Runtime;
pub use entry::{CallFrame, EntryPoint, FnEntryPoint, InputLayouts, KernelArg, KernelFault};
pub use error::*;
pub use native::{NativeFn, NativeFunction, NativeLibrary};
pub use planner::{BufferPlan, PlanOptions};
pub use registry::{FunctionRegistry, RegistryEntry, RegistryPhase, lookup, registry};
pub use signature::{
    AliasRule, BufferRequest, Dim, FunctionKey, Layout, Lifetime, SIGNATURE_FORMAT_VERSION, SignatureDescriptor,
    SizeExpr, TensorSpec,
};
pub use tensor::{Shape, Tensor, TensorView};
pub use validator::BoundDims;

pub use kiln_dtype::DType;
