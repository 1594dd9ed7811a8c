//! Host-memory [`NativeRuntime`] for tests and benchmarks.
//!
//! Kernels are not computed here. `invoke` allocates an output buffer shaped
//! like its first input and leaves it zeroed. Release bookkeeping keeps one
//! entry per id ever released; turn it off with
//! [`with_release_log`](ArenaRuntime::with_release_log) for long runs.

use crate::ffi::{NativeError, NativeRuntime};
use crate::handle::NativeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ArenaRuntime {
    next_id: AtomicU64,
    buffers: Mutex<HashMap<NativeId, Vec<f32>>>,
    release_calls: Mutex<HashMap<NativeId, usize>>,
    free_ids: Mutex<Vec<NativeId>>,
    allocations: AtomicUsize,
    fail_allocations: AtomicBool,
    fail_releases: AtomicBool,
    release_delay: Mutex<Option<Duration>>,
    record_releases: bool,
    reuse_ids: bool,
}

impl ArenaRuntime {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            record_releases: true,
            ..Default::default()
        }
    }

    /// Per-id release counts for [`release_count`](Self::release_count).
    /// On by default.
    pub fn with_release_log(mut self, on: bool) -> Self {
        self.record_releases = on;
        self
    }

    /// Hands released ids out again, most recent first, the way `malloc`
    /// returns a just-freed address.
    pub fn with_id_reuse(mut self, on: bool) -> Self {
        self.reuse_ids = on;
        self
    }

    /// Makes `release` block for `delay` after the id has been freed.
    pub fn set_release_delay(&self, delay: Option<Duration>) {
        *self.release_delay.lock() = delay;
    }

    fn store(&self, buffer: Vec<f32>) -> NativeId {
        let reused = if self.reuse_ids {
            self.free_ids.lock().pop()
        } else {
            None
        };
        let id = reused
            .unwrap_or_else(|| NativeId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed)));
        self.buffers.lock().insert(id, buffer);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Makes every later allocation fail until switched off.
    pub fn set_fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::Relaxed);
    }

    /// Makes every later release fail until switched off. The buffer is
    /// still dropped so the failure is observable without leaking.
    pub fn set_fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::Relaxed);
    }

    pub fn is_live(&self, id: NativeId) -> bool {
        self.buffers.lock().contains_key(&id)
    }

    pub fn live_count(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// How many times `release` was called for `id`, successful or not.
    pub fn release_count(&self, id: NativeId) -> usize {
        self.release_calls.lock().get(&id).copied().unwrap_or(0)
    }

    /// Largest per-id release count seen so far.
    pub fn max_release_count(&self) -> usize {
        self.release_calls.lock().values().copied().max().unwrap_or(0)
    }

    pub fn len_of(&self, id: NativeId) -> Option<usize> {
        self.buffers.lock().get(&id).map(Vec::len)
    }
}

impl NativeRuntime for ArenaRuntime {
    fn allocate(&self, shape: &[usize]) -> Result<NativeId, NativeError> {
        if self.fail_allocations.load(Ordering::Relaxed) {
            return Err(NativeError::AllocationFailed(format!("shape {shape:?}")));
        }

        let numel = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| NativeError::AllocationFailed(format!("shape {shape:?} overflows")))?;
        Ok(self.store(vec![0.0; numel]))
    }

    fn invoke(&self, op: &str, inputs: &[NativeId]) -> Result<NativeId, NativeError> {
        if op.is_empty() {
            return Err(NativeError::InvalidOperation(op.to_string()));
        }
        let first = inputs.first().ok_or_else(|| NativeError::Arity {
            op: op.to_string(),
            expected: 1,
            got: 0,
        })?;
        if self.fail_allocations.load(Ordering::Relaxed) {
            return Err(NativeError::AllocationFailed(format!("output of {op}")));
        }

        let numel = {
            let buffers = self.buffers.lock();
            for id in inputs {
                if !buffers.contains_key(id) {
                    return Err(NativeError::UnknownHandle(*id));
                }
            }
            buffers[first].len()
        };
        Ok(self.store(vec![0.0; numel]))
    }

    fn release(&self, id: NativeId) -> Result<(), NativeError> {
        if self.record_releases {
            *self.release_calls.lock().entry(id).or_insert(0) += 1;
        }

        let removed = self.buffers.lock().remove(&id);
        if removed.is_none() {
            return Err(NativeError::UnknownHandle(id));
        }
        if self.reuse_ids {
            self.free_ids.lock().push(id);
        }
        let delay = *self.release_delay.lock();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if self.fail_releases.load(Ordering::Relaxed) {
            return Err(NativeError::Message(format!("injected release failure for {id}")));
        }
        Ok(())
    }

    fn resident_bytes(&self, id: NativeId) -> usize {
        self.len_of(id)
            .map(|n| n * std::mem::size_of::<f32>())
            .unwrap_or(0)
    }
}
