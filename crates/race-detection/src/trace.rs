use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Error, anyhow, ensure};
use parking_lot::Mutex;

mod event;
mod mutexset;
mod stack;

pub use event::{Event, EventType};
pub use mutexset::{MutexDesc, MutexSet};
pub use stack::ShadowStack;

/// Number of events per trace part used when deriving the geometry from the
/// `history_size` flag.
pub const DEFAULT_PART_SIZE: u64 = 1 << 13;

/// Shape of a per-thread trace ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceGeometry {
    /// Number of events per part.
    pub part_size: u64,
    /// Number of parts in the ring.
    pub parts: u64,
}

impl TraceGeometry {
    /// Creates a geometry of `parts` parts with `part_size` events each.
    ///
    /// # Errors
    ///
    /// Fails if either value is zero or the total number of events does not
    /// fit the address space.
    pub fn new(part_size: u64, parts: u64) -> Result<Self, Error> {
        ensure!(part_size > 0, "Trace part size must not be zero");
        ensure!(parts > 0, "Trace must have at least one part");
        let size = part_size
            .checked_mul(parts)
            .ok_or_else(|| anyhow!("Trace of {parts} x {part_size} events is too large"))?;
        usize::try_from(size)?;
        Ok(Self { part_size, parts })
    }

    /// The geometry selected by the `history_size` flag: `2^(history_size + 1)`
    /// parts of [`DEFAULT_PART_SIZE`] events.
    pub fn from_history_size(history_size: u32) -> Result<Self, Error> {
        ensure!(
            history_size <= 7,
            "history_size must be within 0..=7, got {history_size}"
        );
        Self::new(DEFAULT_PART_SIZE, 1 << (history_size + 1))
    }

    /// Total number of events retained.
    pub fn size(&self) -> u64 {
        self.part_size * self.parts
    }

    /// Index of the part holding the event of `epoch`.
    pub fn part_of(&self, epoch: u64) -> usize {
        ((epoch / self.part_size) % self.parts) as usize
    }

    /// `true` iff the event of `epoch` is the first of its part.
    #[inline]
    pub fn starts_part(&self, epoch: u64) -> bool {
        epoch % self.part_size == 0
    }

    /// First epoch of the part holding `epoch`.
    pub fn part_start(&self, epoch: u64) -> u64 {
        epoch - epoch % self.part_size
    }
}

/// State of a thread at the start of a trace part.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TraceHeader {
    /// Epoch of the first event of the part.
    pub epoch0: u64,
    /// Call stack before the first event of the part.
    pub stack0: Vec<u64>,
    /// Frames above `stack0` the thread could not record.
    pub hidden0: usize,
    /// Mutexes held before the first event of the part.
    pub mset0: MutexSet,
}

/// Call stack and held mutexes reconstructed from a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredContext {
    /// Frames outermost first. The last frame is the pc of the event itself.
    pub stack: Vec<u64>,
    pub mset: MutexSet,
}

/// The event history of one thread.
///
/// The trace is a ring of [`TraceGeometry::parts`] parts, each holding
/// [`TraceGeometry::part_size`] events and a [`TraceHeader`]. Once the ring
/// wraps, the oldest part is overwritten and its history is gone.
///
/// Only the owning thread writes a trace. Events are stored with relaxed
/// atomics and without locking. Headers are written and read under the trace
/// mutex, which any other thread must hold while reconstructing history
/// through [`Trace::restore`].
pub struct Trace {
    geometry: TraceGeometry,
    events: Box<[AtomicU64]>,
    headers: Mutex<Box<[TraceHeader]>>,
}

impl Trace {
    pub fn new(geometry: TraceGeometry) -> Self {
        let events = (0..geometry.size()).map(|_| AtomicU64::new(0)).collect();
        let headers = (0..geometry.parts).map(|_| TraceHeader::default()).collect();

        Self {
            geometry,
            events,
            headers: Mutex::new(headers),
        }
    }

    pub fn geometry(&self) -> TraceGeometry {
        self.geometry
    }

    /// Writes the header of the part holding `epoch`.
    ///
    /// The header records `epoch` as the start of the part together with the
    /// given stack and mutex set. It has to be written before any event of
    /// that part.
    pub fn switch_part(&self, epoch: u64, stack: &ShadowStack, mset: &MutexSet) {
        let part = self.geometry.part_of(epoch);
        let mut headers = self.headers.lock();
        let header = &mut headers[part];
        header.epoch0 = epoch;
        header.stack0.clear();
        header.stack0.extend_from_slice(stack.frames());
        header.hidden0 = stack.hidden();
        header.mset0 = mset.clone();
    }

    /// Stores `event` as the event of `epoch`.
    ///
    /// Only the owning thread may call this. If `epoch` starts a new part,
    /// [`Trace::switch_part`] has to be called first.
    #[inline]
    pub fn store_event(&self, epoch: u64, event: Event) {
        let pos = (epoch % self.geometry.size()) as usize;
        self.events[pos].store(event.raw(), Ordering::Relaxed);
    }

    /// Returns a copy of the header of part `idx`.
    pub fn header(&self, idx: usize) -> Option<TraceHeader> {
        self.headers.lock().get(idx).cloned()
    }

    /// Reconstructs the call stack and held mutexes of the owning thread as of
    /// the event at `epoch`.
    ///
    /// Returns `None` if the part holding `epoch` has been overwritten or not
    /// been written yet.
    pub fn restore(&self, epoch: u64) -> Option<RestoredContext> {
        let headers = self.headers.lock();
        let header = &headers[self.geometry.part_of(epoch)];
        if header.epoch0 != self.geometry.part_start(epoch) {
            return None;
        }

        let mut stack = header.stack0.clone();
        let mut mset = header.mset0.clone();
        // The slot past the recorded frames holds the pc of the latest event.
        let mut pos = stack.len();
        stack.push(0);
        // Calls and returns above the recorded frames cancel out.
        let mut hidden = header.hidden0;

        let begin = header.epoch0;
        for e in begin..=epoch {
            let raw = self.events[(e % self.geometry.size()) as usize].load(Ordering::Relaxed);
            let Ok((typ, pc)) = Event::from_raw(raw).decode() else {
                continue;
            };
            match typ {
                EventType::Mop => stack[pos] = pc,
                EventType::FuncEnter if hidden > 0 => hidden += 1,
                EventType::FuncExit if hidden > 0 => hidden -= 1,
                EventType::FuncEnter => {
                    stack[pos] = pc;
                    pos += 1;
                    if stack.len() <= pos {
                        stack.push(0);
                    }
                }
                EventType::FuncExit => pos = pos.saturating_sub(1),
                EventType::Lock => mset.add(pc, true, e),
                EventType::Unlock => mset.del(pc),
                EventType::RLock => mset.add(pc, false, e),
                EventType::RUnlock => mset.del(pc),
            }
        }

        stack.truncate(pos + 1);
        if stack.len() == 1 && stack[0] == 0 {
            return None;
        }

        Some(RestoredContext { stack, mset })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;

    use super::{Event, EventType, MutexSet, ShadowStack, Trace, TraceGeometry};

    /// Appends events the way a thread does: a header at each part start,
    /// then the event itself.
    struct Writer {
        trace: Trace,
        epoch: u64,
        stack: ShadowStack,
        mset: MutexSet,
    }

    impl Writer {
        fn new(geometry: TraceGeometry) -> Self {
            Self::with_stack(geometry, ShadowStack::default())
        }

        fn with_stack(geometry: TraceGeometry, stack: ShadowStack) -> Self {
            let trace = Trace::new(geometry);
            trace.switch_part(0, &stack, &MutexSet::new());
            Self {
                trace,
                epoch: 0,
                stack,
                mset: MutexSet::new(),
            }
        }

        fn add(&mut self, typ: EventType, pc: u64) -> u64 {
            self.epoch += 1;
            if self.trace.geometry().starts_part(self.epoch) {
                self.trace.switch_part(self.epoch, &self.stack, &self.mset);
            }
            self.trace.store_event(self.epoch, Event::new(typ, pc));
            match typ {
                EventType::FuncEnter => self.stack.push(pc),
                EventType::FuncExit => self.stack.pop(),
                EventType::Lock => self.mset.add(pc, true, self.epoch),
                EventType::Unlock => self.mset.del(pc),
                _ => {}
            }
            self.epoch
        }
    }

    #[test]
    fn geometry_from_history_size() -> Result<(), Error> {
        let geometry = TraceGeometry::from_history_size(2)?;
        assert_eq!(geometry.parts, 8);
        assert_eq!(geometry.size(), 8 * 8192);
        TraceGeometry::from_history_size(8).unwrap_err();
        TraceGeometry::new(0, 4).unwrap_err();
        TraceGeometry::new(8, 0).unwrap_err();
        Ok(())
    }

    #[test]
    fn restore_replays_stack_and_mutexes() -> Result<(), Error> {
        let mut writer = Writer::new(TraceGeometry::new(64, 2)?);
        writer.add(EventType::FuncEnter, 0x100);
        writer.add(EventType::Lock, 0xa0);
        writer.add(EventType::FuncEnter, 0x200);
        let access = writer.add(EventType::Mop, 0x210);
        writer.add(EventType::FuncExit, 0);
        writer.add(EventType::Unlock, 0xa0);
        let later = writer.add(EventType::Mop, 0x120);

        let ctx = writer.trace.restore(access).unwrap();
        assert_eq!(ctx.stack, vec![0x100, 0x200, 0x210]);
        assert_eq!(ctx.mset.size(), 1);
        assert_eq!(ctx.mset.get(0).map(|d| d.id), Some(0xa0));

        let ctx = writer.trace.restore(later).unwrap();
        assert_eq!(ctx.stack, vec![0x100, 0x120]);
        assert!(ctx.mset.is_empty());

        Ok(())
    }

    #[test]
    fn restore_uses_header_snapshot_of_later_parts() -> Result<(), Error> {
        let mut writer = Writer::new(TraceGeometry::new(8, 4)?);
        writer.add(EventType::FuncEnter, 0x1);
        writer.add(EventType::Lock, 0xb0);
        for i in 0..10 {
            writer.add(EventType::Mop, 0x50 + i);
        }
        // Epoch 12 lives in part 1, whose header was written at epoch 8.
        let ctx = writer.trace.restore(12).unwrap();
        assert_eq!(ctx.stack, vec![0x1, 0x59]);
        assert_eq!(ctx.mset.get(0).map(|d| d.id), Some(0xb0));
        Ok(())
    }

    #[test]
    fn ring_overwrites_oldest_part() -> Result<(), Error> {
        let geometry = TraceGeometry::new(8, 4)?;
        let mut writer = Writer::new(geometry);

        writer.add(EventType::FuncEnter, 0x10);
        for i in 0..30 {
            writer.add(EventType::Mop, 0x1000 + i);
        }
        assert_eq!(writer.epoch, 31);
        assert_eq!(writer.trace.header(0).unwrap().epoch0, 0);
        assert!(writer.trace.restore(3).is_some());

        // Part 0 is reused by the call at epoch 32.
        writer.add(EventType::FuncEnter, 0x20);
        let first_of_reused = writer.add(EventType::Mop, 0x2000);
        assert_eq!(first_of_reused, 33);

        let header = writer.trace.header(0).unwrap();
        assert_eq!(header.epoch0, 32);
        assert_eq!(header.stack0, vec![0x10]);

        assert!(writer.trace.restore(3).is_none());
        assert!(writer.trace.restore(31).is_some());
        assert_eq!(writer.trace.restore(33).unwrap().stack, vec![0x10, 0x20, 0x2000]);

        Ok(())
    }

    #[test]
    fn restore_skips_returns_of_unrecorded_frames() -> Result<(), Error> {
        let geometry = TraceGeometry::new(8, 4)?;
        let mut writer = Writer::with_stack(geometry, ShadowStack::with_capacity(2));
        writer.add(EventType::FuncEnter, 0x1);
        writer.add(EventType::FuncEnter, 0x2);
        for i in 0..3 {
            writer.add(EventType::FuncEnter, 0x10 + i);
        }
        for _ in 0..2 {
            writer.add(EventType::Mop, 0x40);
        }

        for _ in 0..3 {
            writer.add(EventType::FuncExit, 0);
        }
        // Part 1 starts five frames deep with only two of them recorded.
        let header = writer.trace.header(1).unwrap();
        assert_eq!((header.stack0.clone(), header.hidden0), (vec![0x1, 0x2], 3));

        let access = writer.add(EventType::Mop, 0x50);
        assert_eq!(access, 11);
        assert_eq!(writer.trace.restore(access).unwrap().stack, vec![0x1, 0x2, 0x50]);

        writer.add(EventType::FuncExit, 0);
        let outer = writer.add(EventType::Mop, 0x60);
        assert_eq!(writer.trace.restore(outer).unwrap().stack, vec![0x1, 0x60]);
        Ok(())
    }

    #[test]
    fn unwritten_parts_cannot_be_restored() -> Result<(), Error> {
        let writer = Writer::new(TraceGeometry::new(8, 4)?);
        assert!(writer.trace.restore(9).is_none());
        Ok(())
    }
}
