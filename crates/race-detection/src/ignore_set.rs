use crate::stack_depot::StackId;

/// A bounded set of stack ids for which race reports are suppressed.
///
/// The set holds at most [`IgnoreSet::MAX_SIZE`] ids. Adding an id to a full
/// set is silently dropped, adding an id that is already present is a no-op.
/// Single entries can not be removed, the set can only be cleared as a whole
/// by [`IgnoreSet::reset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreSet {
    size: usize,
    stacks: [StackId; Self::MAX_SIZE],
}

impl IgnoreSet {
    /// Maximum number of stack ids the set can hold.
    pub const MAX_SIZE: usize = 16;

    /// Creates an empty ignore set.
    pub const fn new() -> Self {
        Self {
            size: 0,
            stacks: [StackId::NONE; Self::MAX_SIZE],
        }
    }

    /// Inserts `stack` unless it is already present or the set is full.
    pub fn add(&mut self, stack: StackId) {
        if self.size == Self::MAX_SIZE || self.contains(stack) {
            return;
        }
        self.stacks[self.size] = stack;
        self.size += 1;
    }

    pub fn reset(&mut self) {
        self.size = 0;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the `i`-th inserted stack id.
    ///
    /// # Panics
    ///
    /// Panics if `i >= self.size()`.
    pub fn at(&self, i: usize) -> StackId {
        assert!(
            i < self.size,
            "IgnoreSet index out of bounds: {i} >= {}",
            self.size
        );
        self.stacks[i]
    }

    pub fn contains(&self, stack: StackId) -> bool {
        self.iter().any(|s| s == stack)
    }

    /// Iterates over the stack ids in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = StackId> + '_ {
        self.stacks[..self.size].iter().copied()
    }
}

impl Default for IgnoreSet {
    fn default() -> Self {
        Self::new()
    }
}
