//! Epoch barrier for bulk reclamation of transient tensors.
//!
//! While the barrier is armed, each newly registered finalization entry
//! carries an [`EpochToken`]. Closing an epoch hands back the wait group that
//! every token of that epoch holds a clone of, so waiting on it blocks until
//! all of them have been finalized. Tokens minted after the close belong to
//! the next epoch.

use crossbeam::sync::WaitGroup;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Idle,
    Armed,
}

/// Which registrations an armed barrier tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpochScope {
    /// Only registrations made on the thread that armed the barrier. Tensors
    /// created by loader threads may then live across iterations.
    #[default]
    ArmingThread,
    AllThreads,
}

#[derive(Debug)]
struct EpochState {
    state: BarrierState,
    armed_by: Option<ThreadId>,
    group: WaitGroup,
    epoch: u64,
}

#[derive(Debug)]
pub(crate) struct EpochBarrier {
    scope: EpochScope,
    inner: Mutex<EpochState>,
    outstanding: Arc<AtomicUsize>,
}

/// Held by a tracked finalization entry until its release action has run.
#[derive(Debug)]
pub(crate) struct EpochToken {
    _group: WaitGroup,
    outstanding: Arc<AtomicUsize>,
    epoch: u64,
}

impl EpochToken {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for EpochToken {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EpochBarrier {
    pub(crate) fn new(scope: EpochScope) -> Self {
        Self {
            scope,
            inner: Mutex::new(EpochState {
                state: BarrierState::Idle,
                armed_by: None,
                group: WaitGroup::new(),
                epoch: 0,
            }),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn state(&self) -> BarrierState {
        self.inner.lock().state
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.state() == BarrierState::Armed
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Idle -> Armed. Returns false if the barrier was already armed.
    pub(crate) fn prepare(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == BarrierState::Armed {
            return false;
        }

        inner.state = BarrierState::Armed;
        inner.armed_by = Some(thread::current().id());
        log::debug!("epoch barrier armed at epoch {}", inner.epoch);
        true
    }

    /// Mints a token for a registration made on the current thread, or `None`
    /// when the registration is not tracked.
    ///
    /// The outstanding counter is incremented here, before the entry the
    /// token belongs to can possibly be finalized.
    pub(crate) fn mint(&self) -> Option<EpochToken> {
        let inner = self.inner.lock();
        if inner.state != BarrierState::Armed {
            return None;
        }
        if self.scope == EpochScope::ArmingThread && inner.armed_by != Some(thread::current().id())
        {
            return None;
        }

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Some(EpochToken {
            _group: inner.group.clone(),
            outstanding: Arc::clone(&self.outstanding),
            epoch: inner.epoch,
        })
    }

    /// Closes the current epoch and returns its wait group. `None` when idle.
    pub(crate) fn close_epoch(&self) -> Option<(u64, WaitGroup)> {
        let mut inner = self.inner.lock();
        if inner.state != BarrierState::Armed {
            return None;
        }

        let closed = inner.epoch;
        inner.epoch += 1;
        let group = std::mem::replace(&mut inner.group, WaitGroup::new());
        Some((closed, group))
    }

    /// Back to Idle regardless of outstanding tokens. Returns false if the
    /// barrier was not armed.
    pub(crate) fn disarm(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == BarrierState::Idle {
            return false;
        }

        inner.state = BarrierState::Idle;
        inner.armed_by = None;
        // Tokens still alive keep the old group; later waits must not see them.
        inner.group = WaitGroup::new();
        inner.epoch += 1;
        log::debug!(
            "epoch barrier disarmed, {} token(s) outstanding",
            self.outstanding()
        );
        true
    }
}
