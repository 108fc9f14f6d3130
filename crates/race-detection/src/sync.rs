use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::clock::VectorClock;

/// Clocks attached to one synchronization object (a mutex or an atomic
/// location).
#[derive(Debug, Default)]
pub struct SyncVar {
    /// Released by write unlocks and release stores.
    pub clock: VectorClock,
    /// Released by read unlocks. Write locks acquire it as well.
    pub read_clock: VectorClock,
}

/// Address-keyed table of [`SyncVar`]s.
///
/// Entries are created on first use and live until [`SyncTab::remove`].
pub struct SyncTab {
    vars: Mutex<HashMap<u64, Arc<Mutex<SyncVar>>>>,
}

impl SyncTab {
    pub fn new() -> Self {
        Self {
            vars: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the sync var of `addr`, creating it if needed.
    pub fn get_or_create(&self, addr: u64) -> Arc<Mutex<SyncVar>> {
        self.vars.lock().entry(addr).or_default().clone()
    }

    /// Returns the sync var of `addr` if one exists.
    pub fn get(&self, addr: u64) -> Option<Arc<Mutex<SyncVar>>> {
        self.vars.lock().get(&addr).cloned()
    }

    pub fn remove(&self, addr: u64) -> Option<Arc<Mutex<SyncVar>>> {
        self.vars.lock().remove(&addr)
    }

    pub fn len(&self) -> usize {
        self.vars.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SyncTab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::SyncTab;

    #[test]
    fn vars_are_shared_per_address() {
        let tab = SyncTab::new();
        let a = tab.get_or_create(0x40);
        let b = tab.get_or_create(0x40);
        let c = tab.get_or_create(0x48);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(tab.len(), 2);

        a.lock().clock.set(1, 7);
        assert_eq!(tab.get(0x40).map(|v| v.lock().clock.get(1)), Some(7));

        tab.remove(0x40);
        assert!(tab.get(0x40).is_none());
        assert_eq!(tab.get_or_create(0x40).lock().clock.get(1), 0);
    }
}
