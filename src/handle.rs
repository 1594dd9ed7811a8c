use crate::GCResult;
use crate::collector::FinalizationEntry;
use crate::gc::TensorGc;
use std::ffi::c_void;
use std::fmt;

/// Identifier of one native resource, as handed out by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeId(u64);

impl NativeId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Pointer-valued runtimes hand out addresses; null is never a handle.
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        if ptr.is_null() {
            None
        } else {
            Some(Self(ptr as usize as u64))
        }
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as usize as *mut c_void
    }
}

impl fmt::Display for NativeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Host-side handle to one native tensor.
///
/// A managed tensor owns its finalization entry. Dropping it hands the entry
/// to the collector; [`Tensor::release`] runs the release action right away.
/// Either way the native `release` runs exactly once.
pub struct Tensor {
    id: NativeId,
    bytes: usize,
    entry: Option<FinalizationEntry>,
    live: bool,
    gc: TensorGc,
}

impl Tensor {
    pub(crate) fn new(
        gc: TensorGc,
        id: NativeId,
        bytes: usize,
        entry: Option<FinalizationEntry>,
    ) -> Self {
        Self {
            id,
            bytes,
            entry,
            live: true,
            gc,
        }
    }

    pub fn id(&self) -> NativeId {
        self.id
    }

    pub fn resident_bytes(&self) -> usize {
        self.bytes
    }

    /// True when dropping this handle releases the native resource.
    pub fn is_managed(&self) -> bool {
        self.entry.is_some()
    }

    /// True when the current epoch barrier waits for this handle.
    pub fn in_epoch(&self) -> bool {
        self.entry.as_ref().is_some_and(|e| e.token.is_some())
    }

    pub fn context(&self) -> &TensorGc {
        &self.gc
    }

    /// Runs `op` on the native side with `self` as the first input.
    pub fn invoke(&self, op: &str, others: &[&Tensor]) -> GCResult<Tensor> {
        let mut inputs = Vec::with_capacity(others.len() + 1);
        inputs.push(self.id);
        inputs.extend(others.iter().map(|t| t.id));

        self.gc.call(|rt| rt.invoke(op, &inputs))
    }

    /// Detaches this handle from the epoch barrier so waits no longer block
    /// on it. Use for tensors created inside an armed loop that must outlive
    /// the iteration.
    pub fn persist(&mut self) {
        if let Some(entry) = self.entry.as_mut() {
            if entry.token.take().is_some() {
                log::trace!("tensor {} persisted past its epoch", self.id);
            }
        }
    }

    /// Releases the native resource now.
    ///
    /// Native failures are returned to the caller; the resource is treated as
    /// released either way and never released again.
    pub fn release(mut self) -> GCResult<()> {
        let entry = self.entry.take();
        self.live = false;
        self.gc.release_now(self.id, entry)
    }

    pub(crate) fn attach(&mut self, entry: FinalizationEntry) {
        self.entry = Some(entry);
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.gc.defer(entry);
        } else if self.live {
            self.gc.forget(self.id);
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("bytes", &self.bytes)
            .field("managed", &self.is_managed())
            .field("in_epoch", &self.in_epoch())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaRuntime;
    use std::sync::Arc;

    #[test]
    fn test_native_id_from_ptr() {
        assert!(NativeId::from_ptr(std::ptr::null_mut()).is_none());

        let mut slot = 7u32;
        let ptr = &mut slot as *mut u32 as *mut c_void;
        let id = NativeId::from_ptr(ptr).unwrap();
        assert_eq!(id.as_ptr(), ptr);
    }

    #[test]
    fn test_native_id_display() {
        assert_eq!(NativeId::from_raw(255).to_string(), "0xff");
    }

    #[test]
    fn test_release_consumes_handle() {
        let rt = Arc::new(ArenaRuntime::new());
        let gc = TensorGc::new(rt.clone()).unwrap();

        let t = gc.empty(&[4]).unwrap();
        let id = t.id();
        assert!(t.is_managed());
        assert_eq!(t.resident_bytes(), 16);

        t.release().unwrap();
        assert_eq!(rt.release_count(id), 1);
        assert!(!rt.is_live(id));
    }

    #[test]
    fn test_invoke_produces_new_handle() {
        let rt = Arc::new(ArenaRuntime::new());
        let gc = TensorGc::new(rt.clone()).unwrap();

        let a = gc.empty(&[2, 2]).unwrap();
        let b = gc.empty(&[2, 2]).unwrap();
        let c = a.invoke("add", &[&b]).unwrap();

        assert_ne!(c.id(), a.id());
        assert_ne!(c.id(), b.id());
        assert_eq!(c.resident_bytes(), a.resident_bytes());
    }

    #[test]
    fn test_persist_leaves_epoch() {
        let rt = Arc::new(ArenaRuntime::new());
        let gc = TensorGc::new(rt).unwrap();
        gc.prepare();

        let mut t = gc.empty(&[1]).unwrap();
        assert!(t.in_epoch());
        assert_eq!(gc.outstanding(), 1);

        t.persist();
        assert!(!t.in_epoch());
        assert!(t.is_managed());
        assert_eq!(gc.outstanding(), 0);

        gc.finish();
    }
}
