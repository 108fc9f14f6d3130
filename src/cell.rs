use std::{
    panic::Location,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Error;

use crate::runtime::{Runtime, pc_of, record};

/// A monitored 8-byte memory location.
///
/// The value itself lives in an atomic, so the cell is always safe to share.
/// What the detector sees is decided by the accessor: [`TracedCell::get`] and
/// [`TracedCell::set`] are reported as plain accesses, the remaining ones as
/// atomic accesses with the given memory order.
pub struct TracedCell {
    addr: u64,
    value: AtomicU64,
}

impl TracedCell {
    /// Allocates a cell holding `value`.
    ///
    /// # Errors
    ///
    /// Fails if the monitored heap of `runtime` is used up.
    pub fn new(runtime: &Runtime, value: u64) -> Result<Self, Error> {
        Ok(Self {
            addr: runtime.alloc(8, 8)?,
            value: AtomicU64::new(value),
        })
    }

    /// Address of the cell in the monitored range.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    #[track_caller]
    pub fn get(&self) -> u64 {
        let pc = pc_of(Location::caller());
        record(|t| t.read(pc, self.addr, 8));
        self.value.load(Ordering::Relaxed)
    }

    #[track_caller]
    pub fn set(&self, value: u64) {
        let pc = pc_of(Location::caller());
        record(|t| t.write(pc, self.addr, 8));
        self.value.store(value, Ordering::Relaxed);
    }

    #[track_caller]
    pub fn load(&self, order: Ordering) -> u64 {
        let pc = pc_of(Location::caller());
        let value = self.value.load(order);
        record(|t| t.atomic_load(pc, self.addr, 3, order));
        value
    }

    #[track_caller]
    pub fn store(&self, value: u64, order: Ordering) {
        let pc = pc_of(Location::caller());
        record(|t| t.atomic_store(pc, self.addr, 3, order));
        self.value.store(value, order);
    }

    /// Adds `delta` and returns the previous value.
    #[track_caller]
    pub fn fetch_add(&self, delta: u64, order: Ordering) -> u64 {
        let pc = pc_of(Location::caller());
        record(|t| t.atomic_rmw(pc, self.addr, 3, order));
        let previous = self.value.fetch_add(delta, order);
        // Pick up releases that landed between the record and the update.
        if matches!(order, Ordering::Acquire | Ordering::AcqRel | Ordering::SeqCst) {
            record(|t| t.acquire(self.addr));
        }
        previous
    }

    /// Marks the cell freed. Later accesses from threads not synchronized with
    /// the current one are reported as use after free.
    #[track_caller]
    pub fn free(&self) {
        let pc = pc_of(Location::caller());
        record(|t| t.memory_range_freed(pc, self.addr, 8));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, atomic::Ordering};

    use anyhow::Error;
    use race_detection::{CollectingSink, ReportKind};

    use super::TracedCell;
    use crate::runtime::Runtime;

    #[test]
    fn plain_accesses_race() -> Result<(), Error> {
        let sink = Arc::new(CollectingSink::new());
        let runtime = Runtime::builder().sink(sink.clone()).build()?;
        let cell = Arc::new(TracedCell::new(&runtime, 1)?);

        let child = {
            let cell = cell.clone();
            runtime.spawn(move || cell.set(2))?
        };
        child.join()?;
        assert!(sink.is_empty());

        // The channel is invisible to the detector and only fixes the order
        // in which both accesses run.
        let (tx, rx) = std::sync::mpsc::channel();
        let racy = {
            let cell = cell.clone();
            runtime.spawn(move || {
                cell.set(3);
                tx.send(())
            })?
        };
        rx.recv()?;
        assert_eq!(cell.get(), 3);
        racy.join()??;

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, ReportKind::DataRace);
        assert_eq!(reports[0].current.addr, cell.addr());
        runtime.shutdown()?;
        Ok(())
    }

    #[test]
    fn atomic_accesses_publish() -> Result<(), Error> {
        let sink = Arc::new(CollectingSink::new());
        let runtime = Runtime::builder().sink(sink.clone()).build()?;
        let data = Arc::new(TracedCell::new(&runtime, 0)?);
        let flag = Arc::new(TracedCell::new(&runtime, 0)?);

        let writer = {
            let (data, flag) = (data.clone(), flag.clone());
            runtime.spawn(move || {
                data.set(42);
                flag.fetch_add(1, Ordering::AcqRel);
            })?
        };
        while flag.load(Ordering::Acquire) == 0 {
            std::thread::yield_now();
        }
        assert_eq!(data.get(), 42);
        writer.join()?;

        assert!(sink.is_empty());
        runtime.shutdown()?;
        Ok(())
    }
}
