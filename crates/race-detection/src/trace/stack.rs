/// The call stack of a thread, kept in a buffer allocated once at thread start.
///
/// Frames pushed beyond the capacity are not stored, only counted, so that
/// the matching pops stay balanced.
pub struct ShadowStack {
    frames: Box<[u64]>,
    len: usize,
    overflow: usize,
}

impl ShadowStack {
    /// Default number of frames a thread can record.
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: vec![0; capacity].into_boxed_slice(),
            len: 0,
            overflow: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, pc: u64) {
        if self.len < self.frames.len() {
            self.frames[self.len] = pc;
            self.len += 1;
        } else {
            self.overflow += 1;
        }
    }

    #[inline]
    pub fn pop(&mut self) {
        if self.overflow > 0 {
            self.overflow -= 1;
        } else if self.len > 0 {
            self.len -= 1;
        }
    }

    /// The recorded frames, outermost first.
    pub fn frames(&self) -> &[u64] {
        &self.frames[..self.len]
    }

    /// Number of frames on top of [`ShadowStack::frames`] that did not fit.
    pub fn hidden(&self) -> usize {
        self.overflow
    }

    /// Copies the frames followed by `pc` into a new stack.
    pub fn snapshot(&self, pc: u64) -> Vec<u64> {
        let mut stack = Vec::with_capacity(self.len + 1);
        stack.extend_from_slice(self.frames());
        stack.push(pc);
        stack
    }
}

impl Default for ShadowStack {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}
