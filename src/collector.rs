//! Finalization registry and the background worker that drains it.

use crate::GCResult;
use crate::epoch::EpochToken;
use crate::error::GCError;
use crate::ffi::{NativeError, NativeRuntime};
use crate::handle::NativeId;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

pub const DEBUG_STATS: u32 = 1 << 0;

pub(crate) type ReleaseFn = Box<dyn FnOnce(NativeId) -> Result<(), NativeError> + Send + Sync>;

pub(crate) enum ReleaseAction {
    Native,
    Custom(ReleaseFn),
}

/// One pending release. Owned by its tensor while the tensor is alive, then
/// by the registry until the worker runs it.
pub(crate) struct FinalizationEntry {
    pub(crate) id: NativeId,
    pub(crate) action: ReleaseAction,
    pub(crate) token: Option<EpochToken>,
    pub(crate) bytes: usize,
}

impl FinalizationEntry {
    pub(crate) fn new(
        id: NativeId,
        action: ReleaseAction,
        token: Option<EpochToken>,
        bytes: usize,
    ) -> Self {
        Self {
            id,
            action,
            token,
            bytes,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    collections: AtomicUsize,
    collected: AtomicUsize,
    released: AtomicUsize,
    uncollectable: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RegistrySnapshot {
    pub collections: usize,
    pub collected: usize,
    pub released: usize,
    pub uncollectable: usize,
    pub total_tracked: usize,
    pub pending: usize,
    pub resident_bytes: usize,
}

pub(crate) struct Registry {
    runtime: Arc<dyn NativeRuntime>,
    live: Mutex<HashSet<NativeId>>,
    unreachable: Mutex<Vec<FinalizationEntry>>,
    pending_bytes: AtomicUsize,
    resident_bytes: AtomicUsize,
    pending_threshold: AtomicUsize,
    pending_bytes_threshold: AtomicUsize,
    waiters: AtomicUsize,
    debug_flags: AtomicU32,
    counters: Counters,
}

impl Registry {
    pub(crate) fn new(
        runtime: Arc<dyn NativeRuntime>,
        pending_threshold: usize,
        pending_bytes_threshold: Option<usize>,
        debug_flags: u32,
    ) -> Self {
        Self {
            runtime,
            live: Mutex::new(HashSet::new()),
            unreachable: Mutex::new(Vec::new()),
            pending_bytes: AtomicUsize::new(0),
            resident_bytes: AtomicUsize::new(0),
            pending_threshold: AtomicUsize::new(pending_threshold),
            pending_bytes_threshold: AtomicUsize::new(pending_bytes_threshold.unwrap_or(usize::MAX)),
            waiters: AtomicUsize::new(0),
            debug_flags: AtomicU32::new(debug_flags),
            counters: Counters::default(),
        }
    }

    pub(crate) fn runtime(&self) -> &dyn NativeRuntime {
        self.runtime.as_ref()
    }

    pub(crate) fn track(&self, id: NativeId) -> GCResult<()> {
        if !self.live.lock().insert(id) {
            return Err(GCError::AlreadyTracked(id));
        }
        Ok(())
    }

    pub(crate) fn untrack(&self, id: NativeId) {
        self.live.lock().remove(&id);
    }

    pub(crate) fn is_tracked(&self, id: NativeId) -> bool {
        self.live.lock().contains(&id)
    }

    pub(crate) fn add_resident(&self, bytes: usize) {
        self.resident_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_pending_threshold(&self, threshold: usize) {
        self.pending_threshold.store(threshold, Ordering::Relaxed);
    }

    pub(crate) fn pending_threshold(&self) -> usize {
        self.pending_threshold.load(Ordering::Relaxed)
    }

    pub(crate) fn set_debug_flags(&self, flags: u32) {
        self.debug_flags.store(flags, Ordering::Relaxed);
    }

    pub(crate) fn debug_flags(&self) -> u32 {
        self.debug_flags.load(Ordering::Relaxed)
    }

    pub(crate) fn enter_wait(&self) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn leave_wait(&self) {
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Queues an unreachable entry. Returns true when a pass should run now:
    /// a barrier is waiting on the entry, or the queue crossed a threshold.
    pub(crate) fn defer(&self, entry: FinalizationEntry) -> bool {
        let tracked = entry.token.is_some();
        let bytes = entry.bytes;

        let queued = {
            let mut unreachable = self.unreachable.lock();
            unreachable.push(entry);
            unreachable.len()
        };
        let pending_bytes = self.pending_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;

        (tracked && self.waiters.load(Ordering::SeqCst) > 0)
            || queued >= self.pending_threshold()
            || pending_bytes >= self.pending_bytes_threshold.load(Ordering::Relaxed)
    }

    /// Runs every queued release action. Returns how many ran.
    pub(crate) fn sweep(&self) -> usize {
        let entries = std::mem::take(&mut *self.unreachable.lock());
        self.counters.collections.fetch_add(1, Ordering::Relaxed);
        if entries.is_empty() {
            return 0;
        }

        let count = entries.len();
        for entry in entries {
            self.pending_bytes.fetch_sub(entry.bytes, Ordering::Relaxed);
            let id = entry.id;
            match self.finalize(entry) {
                Ok(()) => {
                    self.counters.collected.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    // Nobody is blocked on this particular entry.
                    log::error!("finalizer for tensor {id} failed: {err}");
                    self.counters.uncollectable.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        log::debug!("collector pass finalized {count} tensor(s)");
        if self.debug_flags() & DEBUG_STATS != 0 {
            log::info!("collector stats: {:?}", self.snapshot());
        }
        count
    }

    /// Releases an entry on the caller's thread, bypassing the queue.
    pub(crate) fn explicit_release(
        &self,
        id: NativeId,
        entry: Option<FinalizationEntry>,
    ) -> Result<(), NativeError> {
        let Some(entry) = entry else {
            // Unmanaged: the caller owns cleanup, only the handle goes away.
            self.untrack(id);
            return Ok(());
        };

        match self.finalize(entry) {
            Ok(()) => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                log::trace!("tensor {id} released explicitly");
                Ok(())
            }
            Err(err) => {
                log::error!("explicit release of tensor {id} failed: {err}");
                self.counters.uncollectable.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    fn finalize(&self, entry: FinalizationEntry) -> Result<(), NativeError> {
        let FinalizationEntry {
            id,
            action,
            token,
            bytes,
        } = entry;

        // The handle is gone; once `release` frees the id the runtime may hand
        // it out again, and the next wrap must not find it tracked.
        self.untrack(id);
        let result = match action {
            ReleaseAction::Native => self.runtime.release(id),
            ReleaseAction::Custom(f) => match panic::catch_unwind(AssertUnwindSafe(|| f(id))) {
                Ok(result) => result,
                Err(_) => Err(NativeError::Message(format!(
                    "release action for {id} panicked"
                ))),
            },
        };

        self.resident_bytes.fetch_sub(bytes, Ordering::Relaxed);
        // The barrier may only observe the release once it has happened.
        drop(token);
        result
    }

    pub(crate) fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            collections: self.counters.collections.load(Ordering::Relaxed),
            collected: self.counters.collected.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            uncollectable: self.counters.uncollectable.load(Ordering::Relaxed),
            total_tracked: self.live.lock().len(),
            pending: self.unreachable.lock().len(),
            resident_bytes: self.resident_bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
enum Command {
    Pass,
    Shutdown,
}

/// Background thread that runs release actions on request.
pub(crate) struct Collector {
    registry: Arc<Registry>,
    sender: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub(crate) fn spawn(registry: Arc<Registry>, name: &str) -> GCResult<Self> {
        let (sender, receiver) = channel::unbounded();
        let worker_registry = Arc::clone(&registry);
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(&worker_registry, receiver))?;

        Ok(Self {
            registry,
            sender,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn request_pass(&self) {
        if self.sender.send(Command::Pass).is_err() {
            log::warn!("collector worker is gone, finalizing on the calling thread");
            self.registry.sweep();
        }
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            // A release action that owned the last context clone runs here.
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                log::error!("collector worker panicked");
            }
        }
        // Anything deferred after the worker's last pass.
        self.registry.sweep();
    }
}

fn run_worker(registry: &Registry, receiver: Receiver<Command>) {
    log::debug!("collector worker started");
    for command in receiver.iter() {
        match command {
            Command::Pass => {
                // Coalesce a burst of requests into one pass.
                let shutdown = receiver
                    .try_iter()
                    .any(|c| matches!(c, Command::Shutdown));
                registry.sweep();
                if shutdown {
                    break;
                }
            }
            Command::Shutdown => {
                registry.sweep();
                break;
            }
        }
    }
    log::debug!("collector worker stopped");
}
