use std::{ops::ControlFlow, sync::atomic::AtomicU64};

use crate::clock::VectorClock;

use super::{
    SHADOW_CNT, Shadow,
    memory::{load_shadow, store_shadow},
};

/// Kind and width of the access currently being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub is_write: bool,
    pub is_atomic: bool,
    pub size_log: u32,
}

impl Access {
    pub fn read(size_log: u32) -> Self {
        Self {
            is_write: false,
            is_atomic: false,
            size_log,
        }
    }

    pub fn write(size_log: u32) -> Self {
        Self {
            is_write: true,
            is_atomic: false,
            size_log,
        }
    }

    pub fn atomic(mut self) -> Self {
        self.is_atomic = true;
        self
    }

    pub fn size(&self) -> u64 {
        1 << self.size_log
    }
}

/// The word waiting to be written during one scan of a cell.
///
/// The first store writes the new access. Every later store in the same scan
/// writes the empty word instead, erasing records the new access supersedes.
pub struct PendingStore {
    word: Shadow,
    stored: bool,
}

impl PendingStore {
    pub fn new(cur: Shadow) -> Self {
        Self {
            word: cur,
            stored: false,
        }
    }

    /// `true` once the new access has been written to some word.
    pub fn stored(&self) -> bool {
        self.stored
    }

    fn store_if_not_yet_stored(&mut self, target: &AtomicU64) {
        store_shadow(target, self.word);
        self.word = Shadow::EMPTY;
        self.stored = true;
    }
}

/// Checks the new access `cur` against one stored shadow word.
///
/// Returns [`ControlFlow::Break`] with the conflicting word if the two
/// accesses race. Otherwise the word is left alone or handed to `pending`
/// for replacement, and the scan may go on with the next word.
#[inline]
pub fn update_shadow_word(
    word: &AtomicU64,
    cur: Shadow,
    access: Access,
    clock: &VectorClock,
    pending: &mut PendingStore,
) -> ControlFlow<Shadow> {
    let old = load_shadow(word);

    if old.is_zero() {
        if !pending.stored() {
            pending.store_if_not_yet_stored(word);
        }
        return ControlFlow::Continue(());
    }

    if Shadow::addr0_and_size_are_equal(cur, old) {
        if Shadow::tids_are_equal(old, cur) {
            if old.is_rw_weaker_or_equal(access.is_write, access.is_atomic) {
                pending.store_if_not_yet_stored(word);
            }
            return ControlFlow::Continue(());
        }
        if old.happens_before(clock) {
            if old.is_rw_weaker_or_equal(access.is_write, access.is_atomic) {
                pending.store_if_not_yet_stored(word);
            }
            return ControlFlow::Continue(());
        }
        if old.is_both_reads_or_atomic(access.is_write, access.is_atomic) {
            return ControlFlow::Continue(());
        }
        return ControlFlow::Break(old);
    }

    if Shadow::two_ranges_intersect(old, cur, access.size()) {
        if Shadow::tids_are_equal(old, cur) {
            return ControlFlow::Continue(());
        }
        if old.is_both_reads_or_atomic(access.is_write, access.is_atomic) {
            return ControlFlow::Continue(());
        }
        if old.happens_before(clock) {
            return ControlFlow::Continue(());
        }
        return ControlFlow::Break(old);
    }

    ControlFlow::Continue(())
}

/// Runs [`update_shadow_word`] over all words of `cell`.
///
/// If no word took the new access, it evicts the word at
/// `cur.epoch() % SHADOW_CNT`. A race stops the scan and returns the
/// conflicting word; words already replaced stay replaced.
pub fn update_cell(
    cell: &[AtomicU64],
    cur: Shadow,
    access: Access,
    clock: &VectorClock,
) -> ControlFlow<Shadow> {
    debug_assert_eq!(cell.len(), SHADOW_CNT);

    let mut pending = PendingStore::new(cur);
    for word in cell {
        update_shadow_word(word, cur, access, clock, &mut pending)?;
    }

    if !pending.stored() {
        let victim = (cur.epoch() % SHADOW_CNT as u64) as usize;
        store_shadow(&cell[victim], cur);
    }

    ControlFlow::Continue(())
}

/// `true` iff `cell` already records an access that makes `cur` redundant:
/// same thread, same bytes, same atomicity, at least as strong, and newer
/// than the last synchronization of the thread at `sync_epoch`.
#[inline]
pub fn contains_same_access(cell: &[AtomicU64], cur: Shadow, sync_epoch: u64) -> bool {
    cell.iter().map(load_shadow).any(|old| {
        !old.is_zero()
            && !old.is_freed()
            && Shadow::tids_are_equal(old, cur)
            && Shadow::addr0_and_size_are_equal(old, cur)
            && old.epoch() > sync_epoch
            && old.is_atomic() == cur.is_atomic()
            && (old.is_write() || !cur.is_write())
    })
}

#[cfg(test)]
mod tests {
    use std::{
        ops::ControlFlow,
        sync::atomic::{AtomicU64, Ordering},
    };

    use rand_xoshiro::{
        Xoshiro256PlusPlus,
        rand_core::{RngCore, SeedableRng},
    };

    use crate::{
        clock::VectorClock,
        shadow::{SHADOW_CNT, Shadow},
    };

    use super::{Access, PendingStore, contains_same_access, update_cell, update_shadow_word};

    fn shadow(tid: u32, epoch: u64, addr0: u64, access: Access) -> Shadow {
        let mut s = Shadow::new(tid, epoch);
        s.set_addr0_and_size_log(addr0, access.size_log);
        s.set_write(access.is_write);
        s.set_atomic(access.is_atomic);
        s
    }

    fn empty_cell() -> [AtomicU64; SHADOW_CNT] {
        std::array::from_fn(|_| AtomicU64::new(0))
    }

    fn cell_with(words: &[Shadow]) -> [AtomicU64; SHADOW_CNT] {
        let cell = empty_cell();
        for (slot, word) in cell.iter().zip(words) {
            slot.store(word.raw(), Ordering::Relaxed);
        }
        cell
    }

    fn raw(cell: &[AtomicU64]) -> Vec<u64> {
        cell.iter().map(|w| w.load(Ordering::Relaxed)).collect()
    }

    fn random_access(rng: &mut Xoshiro256PlusPlus) -> (u64, Access) {
        let size_log = rng.next_u32() % 4;
        let addr0 = (u64::from(rng.next_u32()) % (8 >> size_log)) << size_log;
        let access = Access {
            is_write: rng.next_u32() % 2 == 0,
            is_atomic: rng.next_u32() % 3 == 0,
            size_log,
        };
        (addr0, access)
    }

    #[test]
    fn empty_slot_stores_new_access() {
        let cell = empty_cell();
        let access = Access::write(3);
        let cur = shadow(1, 5, 0, access);

        let outcome = update_cell(&cell, cur, access, &VectorClock::new());

        assert_eq!(outcome, ControlFlow::Continue(()));
        assert_eq!(raw(&cell), vec![cur.raw(), 0, 0, 0]);
    }

    #[test]
    fn only_first_empty_slot_is_written() {
        let cell = empty_cell();
        let access = Access::read(0);
        let cur = shadow(2, 9, 3, access);
        let mut pending = PendingStore::new(cur);
        let clock = VectorClock::new();

        for word in &cell {
            assert_eq!(
                update_shadow_word(word, cur, access, &clock, &mut pending),
                ControlFlow::Continue(())
            );
        }

        assert!(pending.stored());
        assert_eq!(raw(&cell), vec![cur.raw(), 0, 0, 0]);
    }

    #[test]
    fn same_thread_never_races() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let clock = VectorClock::new();

        for i in 0..2000 {
            let (old_addr0, old_access) = random_access(&mut rng);
            let (cur_addr0, cur_access) = random_access(&mut rng);
            let old = shadow(3, 10, old_addr0, old_access);
            let cur = shadow(3, 11 + i, cur_addr0, cur_access);

            let cell = cell_with(&[old]);
            assert_eq!(
                update_cell(&cell, cur, cur_access, &clock),
                ControlFlow::Continue(()),
                "{old:?} vs {cur:?}"
            );
        }
    }

    #[test]
    fn happens_before_never_races() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let mut clock = VectorClock::new();
        clock.set(1, 100);

        for _ in 0..2000 {
            let (old_addr0, old_access) = random_access(&mut rng);
            let (cur_addr0, cur_access) = random_access(&mut rng);
            let old = shadow(1, 1 + u64::from(rng.next_u32()) % 100, old_addr0, old_access);
            let cur = shadow(2, 7, cur_addr0, cur_access);

            let cell = cell_with(&[old]);
            assert_eq!(
                update_cell(&cell, cur, cur_access, &clock),
                ControlFlow::Continue(()),
                "{old:?} vs {cur:?}"
            );
        }
    }

    #[test]
    fn concurrent_reads_never_race() {
        let clock = VectorClock::new();
        let old = shadow(1, 4, 0, Access::read(3));

        for (addr0, size_log) in [(0, 3), (0, 0), (4, 2), (6, 1), (7, 0)] {
            let access = Access::read(size_log);
            let cur = shadow(2, 9, addr0, access);
            let cell = cell_with(&[old]);
            assert_eq!(
                update_cell(&cell, cur, access, &clock),
                ControlFlow::Continue(())
            );
        }
    }

    #[test]
    fn concurrent_write_on_same_bytes_races() {
        let clock = VectorClock::new();
        let cases = [
            (Access::write(2), Access::write(2)),
            (Access::write(2), Access::read(2)),
            (Access::read(2), Access::write(2)),
            (Access::write(2).atomic(), Access::write(2)),
            (Access::write(2), Access::read(2).atomic()),
        ];

        for (old_access, cur_access) in cases {
            let old = shadow(1, 4, 4, old_access);
            let cur = shadow(2, 9, 4, cur_access);
            let cell = cell_with(&[old]);
            let before = raw(&cell);

            assert_eq!(
                update_cell(&cell, cur, cur_access, &clock),
                ControlFlow::Break(old)
            );
            assert_eq!(raw(&cell), before);
        }
    }

    #[test]
    fn concurrent_atomics_do_not_race() {
        let clock = VectorClock::new();
        let access = Access::write(3).atomic();
        let old = shadow(1, 4, 0, access);
        let cur = shadow(2, 9, 0, access);
        let cell = cell_with(&[old]);

        assert_eq!(
            update_cell(&cell, cur, access, &clock),
            ControlFlow::Continue(())
        );
        assert_eq!(raw(&cell), vec![old.raw(), cur.raw(), 0, 0]);
    }

    #[test]
    fn partial_overlap_races_without_store() {
        let clock = VectorClock::new();
        let old = shadow(1, 4, 0, Access::write(3));
        let access = Access::write(0);
        let cur = shadow(2, 9, 5, access);
        let cell = cell_with(&[old]);

        assert_eq!(
            update_cell(&cell, cur, access, &clock),
            ControlFlow::Break(old)
        );
        assert_eq!(raw(&cell), vec![old.raw(), 0, 0, 0]);
    }

    #[test]
    fn partial_overlap_is_never_replaced() {
        let mut clock = VectorClock::new();
        clock.set(1, 10);
        let old = shadow(1, 4, 0, Access::read(3));
        let access = Access::write(1);
        let cur = shadow(2, 9, 2, access);
        let cell = cell_with(&[old]);

        assert_eq!(
            update_cell(&cell, cur, access, &clock),
            ControlFlow::Continue(())
        );
        // The overlapping word stays, the new access takes the empty slot.
        assert_eq!(raw(&cell), vec![old.raw(), cur.raw(), 0, 0]);
    }

    #[test]
    fn disjoint_ranges_leave_cell_untouched() {
        let clock = VectorClock::new();
        let old = shadow(1, 4, 0, Access::write(2));
        let access = Access::write(2);
        let cur = shadow(2, 9, 4, access);
        let others: Vec<Shadow> = (0..SHADOW_CNT as u64)
            .map(|i| shadow(1, 4 + i, 0, Access::write(2)))
            .collect();

        // With a free slot, only the free slot changes.
        let cell = cell_with(&[old]);
        let mut pending = PendingStore::new(cur);
        assert_eq!(
            update_shadow_word(&cell[0], cur, access, &clock, &mut pending),
            ControlFlow::Continue(())
        );
        assert!(!pending.stored());
        assert_eq!(raw(&cell), vec![old.raw(), 0, 0, 0]);

        // Full cell: every word is scanned without a race.
        let cell = cell_with(&others);
        assert_eq!(
            update_cell(&cell, cur, access, &clock),
            ControlFlow::Continue(())
        );
    }

    #[test]
    fn same_thread_stronger_access_replaces_and_erases_duplicates() {
        let clock = VectorClock::new();
        let read = Access::read(3);
        let first = shadow(1, 2, 0, read);
        let second = shadow(1, 3, 0, read);
        let write = Access::write(3);
        let cur = shadow(1, 7, 0, write);
        let cell = cell_with(&[first, second]);

        assert_eq!(
            update_cell(&cell, cur, write, &clock),
            ControlFlow::Continue(())
        );
        assert_eq!(raw(&cell), vec![cur.raw(), 0, 0, 0]);
    }

    #[test]
    fn same_thread_weaker_access_keeps_write() {
        let clock = VectorClock::new();
        let old = shadow(1, 2, 0, Access::write(3));
        let read = Access::read(3);
        let cur = shadow(1, 7, 0, read);
        let cell = cell_with(&[old]);

        assert_eq!(update_cell(&cell, cur, read, &clock), ControlFlow::Continue(()));
        assert_eq!(raw(&cell), vec![old.raw(), cur.raw(), 0, 0]);
    }

    #[test]
    fn full_cell_evicts_by_epoch() {
        let clock = VectorClock::new();
        let words: Vec<Shadow> = (0..SHADOW_CNT as u64)
            .map(|i| shadow(1, 1 + i, i, Access::write(0)))
            .collect();
        let access = Access::write(0);
        let cur = shadow(2, 6, 7, access);
        let cell = cell_with(&words);

        assert_eq!(update_cell(&cell, cur, access, &clock), ControlFlow::Continue(()));
        let mut expected: Vec<u64> = words.iter().map(|w| w.raw()).collect();
        expected[6 % SHADOW_CNT] = cur.raw();
        assert_eq!(raw(&cell), expected);
    }

    #[test]
    fn same_access_fast_path() {
        let write = Access::write(2);
        let old = shadow(1, 5, 4, write);
        let cell = cell_with(&[old]);

        assert!(contains_same_access(&cell, shadow(1, 6, 4, write), 0));
        assert!(contains_same_access(&cell, shadow(1, 6, 4, Access::read(2)), 0));
        // Synchronized since the recorded access.
        assert!(!contains_same_access(&cell, shadow(1, 6, 4, write), 5));
        assert!(!contains_same_access(&cell, shadow(2, 6, 4, write), 0));
        assert!(!contains_same_access(&cell, shadow(1, 6, 0, write), 0));
        assert!(!contains_same_access(&cell, shadow(1, 6, 4, write.atomic()), 0));

        let read_cell = cell_with(&[shadow(1, 5, 4, Access::read(2))]);
        assert!(!contains_same_access(&read_cell, shadow(1, 6, 4, write), 0));
    }
}
