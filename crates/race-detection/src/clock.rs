//! Vector clocks establishing the happens-before relation between threads.
//!
//! Every thread owns a [`VectorClock`] whose entry `i` is the latest epoch of
//! thread slot `i` that the owner has synchronized with. Its own entry is
//! brought up to date right before each release. Sync objects (mutexes,
//! atomics, thread start and finish) carry a [`VectorClock`] as well.

/// A growable vector clock indexed by thread slot.
///
/// Entries that were never set read as `0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    clk: Vec<u64>,
}

impl VectorClock {
    pub const fn new() -> Self {
        Self { clk: Vec::new() }
    }

    #[inline]
    pub fn get(&self, tid: u32) -> u64 {
        self.clk.get(tid as usize).copied().unwrap_or(0)
    }

    pub fn set(&mut self, tid: u32, epoch: u64) {
        let idx = tid as usize;
        if idx >= self.clk.len() {
            self.clk.resize(idx + 1, 0);
        }
        self.clk[idx] = epoch;
    }

    /// Number of slots this clock currently tracks.
    pub fn len(&self) -> usize {
        self.clk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clk.is_empty()
    }

    /// Element-wise maximum with `other`.
    pub fn join(&mut self, other: &VectorClock) {
        if other.clk.len() > self.clk.len() {
            self.clk.resize(other.clk.len(), 0);
        }
        for (mine, theirs) in self.clk.iter_mut().zip(other.clk.iter()) {
            *mine = (*mine).max(*theirs);
        }
    }

    /// Synchronizes with everything released into `sync`.
    pub fn acquire(&mut self, sync: &VectorClock) {
        self.join(sync);
    }

    /// Publishes this clock into `sync`, keeping what `sync` already held.
    pub fn release(&self, sync: &mut VectorClock) {
        sync.join(self);
    }

    /// Publishes this clock into `sync`, discarding what `sync` held before.
    pub fn release_store(&self, sync: &mut VectorClock) {
        sync.clk.clone_from(&self.clk);
    }

    /// `true` iff an access of thread `tid` at `epoch` happened before the
    /// current point of the owner of this clock.
    #[inline]
    pub fn observed(&self, tid: u32, epoch: u64) -> bool {
        epoch <= self.get(tid)
    }
}
