use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Error, ensure};

use super::{SHADOW_CELL, SHADOW_CNT, Shadow};

/// Shadow words for a contiguous range of application memory.
///
/// Every [`SHADOW_CELL`]-byte cell of the monitored range `[base, base + len)`
/// owns [`SHADOW_CNT`] words. Words are read and written with relaxed atomics
/// and without any lock: threads updating the same cell concurrently may
/// observe stale words or overwrite each other's stores. This costs the odd
/// lost record, never a torn word.
pub struct ShadowMemory {
    base: u64,
    len: u64,
    words: Box<[AtomicU64]>,
}

impl ShadowMemory {
    /// Creates an empty shadow for `len` bytes of application memory starting
    /// at `base`.
    ///
    /// # Errors
    ///
    /// Fails if `base` is not cell-aligned, `len` is zero, or the range wraps
    /// around the address space.
    pub fn new(base: u64, len: u64) -> Result<Self, Error> {
        ensure!(
            base % SHADOW_CELL == 0,
            "Shadow base {base:#x} is not aligned to {SHADOW_CELL} bytes"
        );
        ensure!(len > 0, "Shadow range must not be empty");
        ensure!(
            base.checked_add(len).is_some(),
            "Shadow range {base:#x}+{len:#x} overflows the address space"
        );

        let cells = usize::try_from(len.div_ceil(SHADOW_CELL))?;
        let words = (0..cells * SHADOW_CNT).map(|_| AtomicU64::new(0)).collect();

        Ok(Self {
            base,
            len: cells as u64 * SHADOW_CELL,
            words,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Length of the monitored range, rounded up to whole cells.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `true` iff `addr` lies inside the monitored range.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.len
    }

    /// Returns the shadow words of the cell containing `addr`, or `None` if
    /// `addr` is not monitored.
    #[inline]
    pub fn cell(&self, addr: u64) -> Option<&[AtomicU64]> {
        if !self.contains(addr) {
            return None;
        }
        let idx = ((addr - self.base) / SHADOW_CELL) as usize * SHADOW_CNT;
        self.words.get(idx..idx + SHADOW_CNT)
    }

    /// Returns a copy of the words of the cell containing `addr`.
    pub fn load_cell(&self, addr: u64) -> Option<[Shadow; SHADOW_CNT]> {
        let cell = self.cell(addr)?;
        let mut out = [Shadow::EMPTY; SHADOW_CNT];
        for (dst, src) in out.iter_mut().zip(cell) {
            *dst = load_shadow(src);
        }
        Some(out)
    }

    /// Clears the shadow of every cell overlapping `[addr, addr + size)`.
    pub fn reset_range(&self, addr: u64, size: u64) {
        self.for_each_cell(addr, size, |cell| {
            for word in cell {
                store_shadow(word, Shadow::EMPTY);
            }
        });
    }

    /// Calls `f` with the words of every monitored cell overlapping
    /// `[addr, addr + size)`.
    pub(crate) fn for_each_cell(&self, addr: u64, size: u64, mut f: impl FnMut(&[AtomicU64])) {
        if size == 0 {
            return;
        }
        let first = (addr - addr % SHADOW_CELL).max(self.base);
        let end = addr.saturating_add(size).min(self.base + self.len);
        let mut cell_addr = first;
        while cell_addr < end {
            if let Some(cell) = self.cell(cell_addr) {
                f(cell);
            }
            cell_addr = match cell_addr.checked_add(SHADOW_CELL) {
                Some(next) => next,
                None => break,
            };
        }
    }
}

#[inline]
pub(crate) fn load_shadow(word: &AtomicU64) -> Shadow {
    Shadow::from_raw(word.load(Ordering::Relaxed))
}

#[inline]
pub(crate) fn store_shadow(word: &AtomicU64, value: Shadow) {
    word.store(value.raw(), Ordering::Relaxed);
}
