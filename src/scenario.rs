use std::sync::{Arc, atomic::Ordering, mpsc};

use anyhow::Error;
use clap::ValueEnum;

use crate::{
    cell::TracedCell,
    mutex::TracingMutex,
    runtime::{Runtime, frame, ignore_accesses},
};

const ITERATIONS: u64 = 100;

/// Small multithreaded programs exercising the detector.
///
/// Several scenarios order their threads through a [`mpsc`] channel. The
/// detector does not see such channels, so they fix the order in which the
/// accesses run without synchronizing them.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    /// Two threads increment a counter without synchronization.
    RacyCounter,
    /// Two threads increment a counter under a mutex.
    MutexCounter,
    /// A child writes a value that its parent reads after joining it.
    ForkJoin,
    /// A child publishes a value through a release store of a flag.
    AtomicFlag,
    /// Two threads write the same location inside ignore regions.
    IgnoredRegion,
    /// A thread reads memory another thread freed.
    UseAfterFree,
}

impl Scenario {
    /// `true` if running the scenario has to produce a report.
    pub fn expects_race(self) -> bool {
        matches!(self, Scenario::RacyCounter | Scenario::UseAfterFree)
    }

    /// Runs the scenario on the current (main) thread of `runtime`.
    pub fn run(self, runtime: &Runtime) -> Result<(), Error> {
        log::info!("Running scenario {self:?}");
        match self {
            Scenario::RacyCounter => racy_counter(runtime),
            Scenario::MutexCounter => mutex_counter(runtime),
            Scenario::ForkJoin => fork_join(runtime),
            Scenario::AtomicFlag => atomic_flag(runtime),
            Scenario::IgnoredRegion => ignored_region(runtime),
            Scenario::UseAfterFree => use_after_free(runtime),
        }
    }
}

fn increment(counter: &TracedCell) {
    let _frame = frame();
    for _ in 0..ITERATIONS {
        counter.set(counter.get() + 1);
    }
}

fn racy_counter(runtime: &Runtime) -> Result<(), Error> {
    let counter = Arc::new(TracedCell::new(runtime, 0)?);
    let (tx, rx) = mpsc::channel();

    let first = {
        let counter = counter.clone();
        runtime.spawn(move || {
            increment(&counter);
            tx.send(())
        })?
    };
    let second = {
        let counter = counter.clone();
        runtime.spawn(move || {
            rx.recv()?;
            increment(&counter);
            Ok::<_, Error>(())
        })?
    };

    first.join()??;
    second.join()??;
    let total = counter.get();
    log::info!("Counter ended at {total}");
    Ok(())
}

fn mutex_counter(runtime: &Runtime) -> Result<(), Error> {
    let counter = Arc::new(TracedCell::new(runtime, 0)?);
    let mutex = Arc::new(TracingMutex::new(()));

    let handles = (0..2)
        .map(|_| {
            let (counter, mutex) = (counter.clone(), mutex.clone());
            runtime.spawn(move || {
                for _ in 0..ITERATIONS {
                    let _guard = mutex.lock();
                    counter.set(counter.get() + 1);
                }
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;
    for handle in handles {
        handle.join()?;
    }

    let total = counter.get();
    log::info!("Counter ended at {total}");
    Ok(())
}

fn fork_join(runtime: &Runtime) -> Result<(), Error> {
    let value = Arc::new(TracedCell::new(runtime, 0)?);
    value.set(1);

    let child = {
        let value = value.clone();
        runtime.spawn(move || value.set(value.get() * 42))?
    };
    child.join()?;

    let handed_over = value.get();
    log::info!("Child handed over {handed_over}");
    Ok(())
}

fn atomic_flag(runtime: &Runtime) -> Result<(), Error> {
    let data = Arc::new(TracedCell::new(runtime, 0)?);
    let flag = Arc::new(TracedCell::new(runtime, 0)?);

    let publisher = {
        let (data, flag) = (data.clone(), flag.clone());
        runtime.spawn(move || {
            data.set(42);
            flag.store(1, Ordering::Release);
        })?
    };
    while flag.load(Ordering::Acquire) == 0 {
        std::thread::yield_now();
    }
    let received = data.get();
    log::info!("Received {received}");

    publisher.join()
}

fn ignored_region(runtime: &Runtime) -> Result<(), Error> {
    let value = Arc::new(TracedCell::new(runtime, 0)?);
    let (tx, rx) = mpsc::channel();

    let writer = {
        let value = value.clone();
        runtime.spawn(move || {
            let _ignore = ignore_accesses();
            value.set(1);
            tx.send(())
        })?
    };
    rx.recv()?;
    {
        let _ignore = ignore_accesses();
        value.set(2);
    }

    writer.join()??;
    Ok(())
}

fn use_after_free(runtime: &Runtime) -> Result<(), Error> {
    let value = Arc::new(TracedCell::new(runtime, 7)?);
    let (tx, rx) = mpsc::channel();

    let reader = {
        let value = value.clone();
        runtime.spawn(move || {
            rx.recv()?;
            let stale = value.get();
            log::info!("Read {stale} after free");
            Ok::<_, Error>(())
        })?
    };
    value.free();
    tx.send(())?;

    reader.join()?
}
