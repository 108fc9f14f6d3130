use std::collections::HashMap;

use parking_lot::Mutex;

/// Identifier of an interned call stack.
///
/// The id `0` ([`StackId::NONE`]) stands for the empty stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StackId(pub u32);

impl StackId {
    pub const NONE: StackId = StackId(0);
}

struct DepotInner {
    ids: HashMap<Vec<u64>, StackId>,
    stacks: Vec<Vec<u64>>,
}

/// Interns call stacks (sequences of program counters) into [`StackId`]s.
///
/// Equal stacks always map to the same id. Ids are never released.
pub struct StackDepot {
    inner: Mutex<DepotInner>,
}

impl StackDepot {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DepotInner {
                ids: HashMap::new(),
                stacks: Vec::new(),
            }),
        }
    }

    /// Returns the id of `stack`, interning it on first use.
    pub fn put(&self, stack: &[u64]) -> StackId {
        if stack.is_empty() {
            return StackId::NONE;
        }

        let mut inner = self.inner.lock();
        if let Some(id) = inner.ids.get(stack) {
            return *id;
        }

        // Ids beyond u32::MAX would alias, so the depot stops growing there.
        let Ok(next) = u32::try_from(inner.stacks.len() + 1) else {
            return StackId::NONE;
        };
        let id = StackId(next);
        inner.stacks.push(stack.to_vec());
        inner.ids.insert(stack.to_vec(), id);
        id
    }

    /// Returns the stack interned under `id`.
    pub fn get(&self, id: StackId) -> Option<Vec<u64>> {
        let idx = usize::try_from(id.0).ok()?.checked_sub(1)?;
        self.inner.lock().stacks.get(idx).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StackDepot {
    fn default() -> Self {
        Self::new()
    }
}
