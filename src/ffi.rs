//! Boundary to the foreign runtime that owns tensor storage.
//!
//! Every allocation the bridge wraps comes through a [`NativeRuntime`]. The
//! runtime is shared by all threads; the only discipline it relies on is that
//! `release` is called at most once per identifier and never while another
//! call on that identifier is in flight.

use crate::handle::NativeId;
use std::ffi::{CStr, CString, c_char, c_void};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeError {
    #[error("{0}")]
    Message(String),

    #[error("Unknown native handle {0}")]
    UnknownHandle(NativeId),

    #[error("Native runtime returned a null handle")]
    NullHandle,

    #[error("Invalid operation name: {0:?}")]
    InvalidOperation(String),

    #[error("Operation {op} expects at least {expected} input(s), got {got}")]
    Arity {
        op: String,
        expected: usize,
        got: usize,
    },

    #[error("Allocation failed: {0}")]
    AllocationFailed(String),
}

/// Operations the bridge needs from a native tensor runtime.
///
/// Each allocating call returns exactly one fresh identifier or an error. The
/// bridge wraps the identifier before anything else can see it.
pub trait NativeRuntime: Send + Sync {
    fn allocate(&self, shape: &[usize]) -> Result<NativeId, NativeError>;

    /// Runs a named kernel over `inputs` and returns the identifier of its
    /// single output.
    fn invoke(&self, op: &str, inputs: &[NativeId]) -> Result<NativeId, NativeError>;

    fn release(&self, id: NativeId) -> Result<(), NativeError>;

    /// Bytes of native storage held by `id`. Runtimes that cannot tell report 0.
    fn resident_bytes(&self, _id: NativeId) -> usize {
        0
    }
}

/// Takes ownership of an error string returned by a C runtime.
///
/// Returns `None` for a null pointer. The string is freed with `libc::free`.
///
/// # Safety
///
/// `err` must be null or a NUL-terminated string allocated with `malloc`
/// that nothing else will free.
pub unsafe fn take_native_error(err: *mut c_char) -> Option<String> {
    if err.is_null() {
        return None;
    }

    let msg = unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned();
    unsafe { libc::free(err as *mut c_void) };
    Some(msg)
}

fn check(err: *mut c_char) -> Result<(), NativeError> {
    match unsafe { take_native_error(err) } {
        Some(msg) => Err(NativeError::Message(msg)),
        None => Ok(()),
    }
}

pub type AllocateFn =
    unsafe extern "C" fn(shape: *const i64, ndim: i64, out: *mut *mut c_void) -> *mut c_char;

pub type InvokeFn = unsafe extern "C" fn(
    op: *const c_char,
    inputs: *const *mut c_void,
    n_inputs: i64,
    out: *mut *mut c_void,
) -> *mut c_char;

pub type ReleaseFn = unsafe extern "C" fn(handle: *mut c_void) -> *mut c_char;

pub type ResidentBytesFn = unsafe extern "C" fn(handle: *mut c_void) -> i64;

/// Function table exported by a C tensor library.
///
/// Every fallible entry returns null on success or a `malloc`'d error message.
#[derive(Debug, Clone, Copy)]
pub struct NativeVTable {
    pub allocate: AllocateFn,
    pub invoke: InvokeFn,
    pub release: ReleaseFn,
    pub resident_bytes: Option<ResidentBytesFn>,
}

/// A [`NativeRuntime`] backed by a C function table. Handles are the raw
/// pointers the library hands out.
#[derive(Debug)]
pub struct CRuntime {
    vtable: NativeVTable,
}

impl CRuntime {
    /// Wraps a C function table.
    ///
    /// # Safety
    ///
    /// - Every function in `vtable` must follow the error-string convention
    ///   described on [`NativeVTable`]
    /// - The functions must be callable from any thread
    /// - `release` must accept every pointer produced by `allocate` or `invoke`
    pub unsafe fn new(vtable: NativeVTable) -> Self {
        Self { vtable }
    }

    fn handle_out(out: *mut c_void) -> Result<NativeId, NativeError> {
        NativeId::from_ptr(out).ok_or(NativeError::NullHandle)
    }
}

impl NativeRuntime for CRuntime {
    fn allocate(&self, shape: &[usize]) -> Result<NativeId, NativeError> {
        let dims = shape
            .iter()
            .map(|&d| i64::try_from(d))
            .collect::<Result<Vec<i64>, _>>()
            .map_err(|_| NativeError::AllocationFailed(format!("shape {shape:?} exceeds i64")))?;
        let mut out: *mut c_void = std::ptr::null_mut();

        check(unsafe { (self.vtable.allocate)(dims.as_ptr(), dims.len() as i64, &mut out) })?;
        Self::handle_out(out)
    }

    fn invoke(&self, op: &str, inputs: &[NativeId]) -> Result<NativeId, NativeError> {
        let name = CString::new(op).map_err(|_| NativeError::InvalidOperation(op.to_string()))?;
        let ptrs: Vec<*mut c_void> = inputs.iter().map(|id| id.as_ptr()).collect();
        let mut out: *mut c_void = std::ptr::null_mut();

        check(unsafe {
            (self.vtable.invoke)(name.as_ptr(), ptrs.as_ptr(), ptrs.len() as i64, &mut out)
        })?;
        Self::handle_out(out)
    }

    fn release(&self, id: NativeId) -> Result<(), NativeError> {
        check(unsafe { (self.vtable.release)(id.as_ptr()) })
    }

    fn resident_bytes(&self, id: NativeId) -> usize {
        match self.vtable.resident_bytes {
            Some(f) => unsafe { f(id.as_ptr()) }.max(0) as usize,
            None => 0,
        }
    }
}
