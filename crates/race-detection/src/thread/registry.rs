use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Error, bail};
use parking_lot::Mutex;

use crate::{
    clock::VectorClock,
    ignore_set::IgnoreSet,
    shadow::MAX_TID,
    trace::{Trace, TraceGeometry},
};

/// Lifecycle of a thread slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Forked, but not started yet.
    Created,
    Running,
    /// Finished, waiting to be joined.
    Finished,
    /// Finished and joined (or detached). The slot may be reused.
    Dead,
}

struct Lifecycle {
    status: ThreadStatus,
    detached: bool,
}

/// The part of a thread's state that other threads may look at.
pub struct ThreadContext {
    tid: u32,
    epoch0: u64,
    epoch1: AtomicU64,
    pub(crate) trace: Trace,
    pub(crate) ignore_set: Mutex<IgnoreSet>,
    /// Clock handed over at thread start (from the parent) and at thread
    /// finish (to the joiner).
    pub(crate) sync: Mutex<VectorClock>,
    lifecycle: Mutex<Lifecycle>,
}

impl ThreadContext {
    fn new(tid: u32, epoch0: u64, geometry: TraceGeometry) -> Self {
        Self {
            tid,
            epoch0,
            epoch1: AtomicU64::new(epoch0),
            trace: Trace::new(geometry),
            ignore_set: Mutex::new(IgnoreSet::new()),
            sync: Mutex::new(VectorClock::new()),
            lifecycle: Mutex::new(Lifecycle {
                status: ThreadStatus::Created,
                detached: false,
            }),
        }
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// Epoch the thread starts at.
    pub fn epoch0(&self) -> u64 {
        self.epoch0
    }

    /// Last epoch of a finished thread.
    pub fn epoch1(&self) -> u64 {
        self.epoch1.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> ThreadStatus {
        self.lifecycle.lock().status
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    /// Returns a copy of the thread's ignore set.
    pub fn ignore_set(&self) -> IgnoreSet {
        self.ignore_set.lock().clone()
    }
}

struct RegistryInner {
    slots: Vec<Option<Arc<ThreadContext>>>,
    quarantine: VecDeque<(u32, u64)>,
}

/// Hands out thread slots.
///
/// Slots of dead threads wait in a FIFO quarantine and are only reused once
/// more than `quarantine_size` of them queue up, or when no fresh slot is
/// left. A reused slot continues the epochs of its previous occupant, so its
/// old shadow words keep looking older than anything the new thread does.
pub struct ThreadRegistry {
    inner: Mutex<RegistryInner>,
    geometry: TraceGeometry,
    quarantine_size: usize,
    max_threads: u32,
}

impl ThreadRegistry {
    pub fn new(geometry: TraceGeometry, quarantine_size: usize) -> Self {
        Self::with_max_threads(geometry, quarantine_size, MAX_TID)
    }

    pub(crate) fn with_max_threads(
        geometry: TraceGeometry,
        quarantine_size: usize,
        max_threads: u32,
    ) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                slots: Vec::new(),
                quarantine: VecDeque::new(),
            }),
            geometry,
            quarantine_size,
            max_threads: max_threads.min(MAX_TID),
        }
    }

    /// Allocates a slot for a new thread.
    ///
    /// # Errors
    ///
    /// Fails if every slot is taken by a thread that is not dead yet.
    pub fn create(&self) -> Result<Arc<ThreadContext>, Error> {
        let mut inner = self.inner.lock();

        let slots_left = inner.slots.len() < self.max_threads as usize;
        let reused = if inner.quarantine.len() > self.quarantine_size || !slots_left {
            inner.quarantine.pop_front()
        } else {
            None
        };

        let (tid, epoch0) = match reused {
            Some((tid, epoch1)) => {
                let part = self.geometry.part_size;
                (tid, (epoch1 / part + 1) * part)
            }
            None if slots_left => {
                inner.slots.push(None);
                ((inner.slots.len() - 1) as u32, 0)
            }
            None => bail!("All {} thread slots are in use", self.max_threads),
        };

        let thread = Arc::new(ThreadContext::new(tid, epoch0, self.geometry));
        inner.slots[tid as usize] = Some(thread.clone());
        log::debug!("Created thread T{tid} starting at epoch {epoch0}");

        Ok(thread)
    }

    /// Returns the thread currently occupying slot `tid`.
    pub fn get(&self, tid: u32) -> Option<Arc<ThreadContext>> {
        self.inner.lock().slots.get(tid as usize).cloned().flatten()
    }

    pub(crate) fn started(&self, thread: &ThreadContext) {
        thread.lifecycle.lock().status = ThreadStatus::Running;
    }

    /// Marks `thread` finished at `epoch1`. A detached thread dies right away.
    pub(crate) fn finished(&self, thread: &ThreadContext, epoch1: u64) {
        thread.epoch1.store(epoch1, Ordering::Relaxed);
        let mut lifecycle = thread.lifecycle.lock();
        if lifecycle.detached {
            lifecycle.status = ThreadStatus::Dead;
            drop(lifecycle);
            self.retire(thread);
        } else {
            lifecycle.status = ThreadStatus::Finished;
        }
    }

    /// Marks a finished `thread` joined.
    ///
    /// # Errors
    ///
    /// Fails if the thread has not finished yet, was already joined, or is
    /// detached.
    pub(crate) fn joined(&self, thread: &ThreadContext) -> Result<(), Error> {
        let mut lifecycle = thread.lifecycle.lock();
        if lifecycle.detached {
            bail!("Thread T{} is detached and can not be joined", thread.tid);
        }
        match lifecycle.status {
            ThreadStatus::Finished => {
                lifecycle.status = ThreadStatus::Dead;
                drop(lifecycle);
                self.retire(thread);
                Ok(())
            }
            ThreadStatus::Dead => bail!("Thread T{} was already joined", thread.tid),
            _ => bail!("Thread T{} has not finished yet", thread.tid),
        }
    }

    /// Marks `thread` detached. A finished thread dies right away.
    ///
    /// # Errors
    ///
    /// Fails if the thread was already joined or detached.
    pub(crate) fn detached(&self, thread: &ThreadContext) -> Result<(), Error> {
        let mut lifecycle = thread.lifecycle.lock();
        if lifecycle.detached || lifecycle.status == ThreadStatus::Dead {
            bail!("Thread T{} was already joined or detached", thread.tid);
        }
        lifecycle.detached = true;
        if lifecycle.status == ThreadStatus::Finished {
            lifecycle.status = ThreadStatus::Dead;
            drop(lifecycle);
            self.retire(thread);
        }
        Ok(())
    }

    fn retire(&self, thread: &ThreadContext) {
        self.inner
            .lock()
            .quarantine
            .push_back((thread.tid, thread.epoch1()));
    }
}
