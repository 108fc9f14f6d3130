/// One mutex held by a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutexDesc {
    /// Address of the mutex.
    pub id: u64,
    /// `true` for a write lock, `false` for a read lock.
    pub write: bool,
    /// Epoch of the thread when the mutex was (last) acquired.
    pub epoch: u64,
    /// Recursion count.
    pub count: u32,
}

/// The bounded set of mutexes a thread currently holds.
///
/// Once [`MutexSet::MAX_SIZE`] mutexes are held, acquiring another one
/// evicts the entry that was acquired longest ago.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexSet {
    size: usize,
    descs: [MutexDesc; Self::MAX_SIZE],
}

impl MutexSet {
    pub const MAX_SIZE: usize = 16;

    pub const fn new() -> Self {
        Self {
            size: 0,
            descs: [MutexDesc {
                id: 0,
                write: false,
                epoch: 0,
                count: 0,
            }; Self::MAX_SIZE],
        }
    }

    pub fn add(&mut self, id: u64, write: bool, epoch: u64) {
        if let Some(desc) = self.descs[..self.size].iter_mut().find(|d| d.id == id) {
            desc.count += 1;
            desc.epoch = epoch;
            return;
        }

        if self.size == Self::MAX_SIZE {
            let oldest = self
                .descs
                .iter()
                .enumerate()
                .min_by_key(|(_, d)| d.epoch)
                .map(|(i, _)| i)
                .unwrap_or(0);
            self.remove_pos(oldest);
        }

        self.descs[self.size] = MutexDesc {
            id,
            write,
            epoch,
            count: 1,
        };
        self.size += 1;
    }

    /// Drops one recursion level of mutex `id`, removing it at zero.
    pub fn del(&mut self, id: u64) {
        if let Some(pos) = self.position(id) {
            self.descs[pos].count -= 1;
            if self.descs[pos].count == 0 {
                self.remove_pos(pos);
            }
        }
    }

    /// Forgets mutex `id` regardless of its recursion count.
    pub fn remove(&mut self, id: u64) {
        if let Some(pos) = self.position(id) {
            self.remove_pos(pos);
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn get(&self, i: usize) -> Option<&MutexDesc> {
        self.descs[..self.size].get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutexDesc> + '_ {
        self.descs[..self.size].iter()
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.descs[..self.size].iter().position(|d| d.id == id)
    }

    fn remove_pos(&mut self, pos: usize) {
        self.descs[pos] = self.descs[self.size - 1];
        self.size -= 1;
    }
}

impl Default for MutexSet {
    fn default() -> Self {
        Self::new()
    }
}
