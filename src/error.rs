use crate::ffi::NativeError;
use crate::handle::NativeId;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum GCError {
    #[error("Native handle {0} is already tracked")]
    AlreadyTracked(NativeId),

    #[error("Native handle {0} already has a finalizer")]
    FinalizerAlreadyRegistered(NativeId),

    #[error("Module field {module}.{field} is not exposed to the walk")]
    InaccessibleField { module: String, field: String },

    #[error("Module {0} is not bound as a root, call bind_root() after construction")]
    UnboundModule(String),

    #[error("Duplicate tensor path: {0}")]
    DuplicatePath(String),

    #[error("Cannot find field {0} in the state dict")]
    MissingStateEntry(String),

    #[error("State dict entry {0} is not used to set any field")]
    UnusedStateEntry(String),

    #[error("Cannot call forward() on an empty Sequential")]
    EmptySequential,

    #[error("Native call failed: {0}")]
    Native(#[from] NativeError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for GCError {
    fn from(err: std::io::Error) -> Self {
        GCError::Internal(format!("IO error: {err}"))
    }
}
