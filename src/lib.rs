//! Tensor handle lifecycle and cross-runtime reclamation.
//!
//! Tensors live in a native runtime; the host only holds [`Tensor`] handles.
//! Dropping a handle defers the native release to a background collector, an
//! epoch barrier lets a training loop block until every transient of the last
//! iteration is gone, and the module walk finds the long-lived parameters and
//! buffers of a model so they can be released deterministically.

pub mod arena;
pub mod collector;
pub mod container;
pub mod epoch;
pub mod error;
pub mod ffi;
pub mod gc;
pub mod handle;
pub mod traversal;

#[derive(Debug, Clone)]
pub struct GCStats {
    pub collections: usize,
    pub collected: usize,
    pub released: usize,
    pub uncollectable: usize,
    pub total_tracked: usize,
    pub pending: usize,
    pub outstanding: usize,
    pub epoch: u64,
    pub resident_bytes: usize,
}

pub use arena::ArenaRuntime;
pub use container::Sequential;
pub use epoch::{BarrierState, EpochScope};
pub use error::GCError;
pub use ffi::{CRuntime, NativeError, NativeRuntime, NativeVTable};
pub use gc::{GcConfig, TensorGc};
pub use handle::{NativeId, Tensor};
pub use traversal::{Module, ModuleBase, TensorKind};

pub type GCResult<T> = Result<T, GCError>;
