//! Provides a mutex reporting its lock and unlock events to the detector
//!
//! Events of threads without an installed detector state are dropped.

use parking_lot::{
    RawMutex,
    lock_api::{self, Mutex},
};

use crate::runtime::record;

/// A raw mutex that tells the detector about every successful lock and
/// unlock.
///
/// This struct wraps and behaves like [`parking_lot::RawMutex`] with the
/// following differences:
/// - The lock is reported after the mutex acquired it
/// - The unlock is reported before the mutex releases it
/// - Dropping the mutex destroys its synchronization state
///
/// The address of the raw mutex identifies it towards the detector, so it
/// must not move while in use.
pub struct TracingRawMutex {
    inner: RawMutex,
}

impl TracingRawMutex {
    fn addr(&self) -> u64 {
        self as *const Self as u64
    }
}

unsafe impl lock_api::RawMutex for TracingRawMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        inner: RawMutex::INIT,
    };

    type GuardMarker = <parking_lot::RawMutex as parking_lot::lock_api::RawMutex>::GuardMarker;

    fn lock(&self) {
        self.inner.lock();
        let addr = self.addr();
        record(|t| t.mutex_lock(addr, addr));
    }

    fn try_lock(&self) -> bool {
        let is_locked = self.inner.try_lock();

        if is_locked {
            let addr = self.addr();
            record(|t| t.mutex_lock(addr, addr));
        }

        is_locked
    }

    unsafe fn unlock(&self) {
        let addr = self.addr();
        record(|t| t.mutex_unlock(addr, addr));

        unsafe { self.inner.unlock() };
    }

    fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl Drop for TracingRawMutex {
    fn drop(&mut self) {
        let addr = self.addr();
        record(|t| t.mutex_destroy(addr, addr));
    }
}

/// A mutual exclusion primitive with race detection support, useful for
/// protecting shared data.
///
/// This mutex behaves exactly like [`parking_lot::Mutex`], except that it
/// orders the critical sections of instrumented threads for the detector.
pub type TracingMutex<T> = Mutex<TracingRawMutex, T>;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Error;
    use race_detection::CollectingSink;

    use super::TracingMutex;
    use crate::{runtime::Runtime, tmgmt};

    #[test]
    fn lock_events_reach_the_detector() -> Result<(), Error> {
        let runtime = Runtime::builder().build()?;
        let mutex = TracingMutex::new(0u32);

        {
            let mut guard = mutex.lock();
            *guard += 1;
            assert_eq!(tmgmt::with_current(|t| t.mutex_set().size())?, 1);
        }
        assert!(tmgmt::with_current(|t| t.mutex_set().is_empty())?);

        let guard = mutex.try_lock();
        assert!(guard.is_some());
        assert_eq!(tmgmt::with_current(|t| t.mutex_set().size())?, 1);
        drop(guard);

        runtime.shutdown()?;
        Ok(())
    }

    #[test]
    fn mutex_orders_accesses_of_threads() -> Result<(), Error> {
        let sink = Arc::new(CollectingSink::new());
        let runtime = Runtime::builder().sink(sink.clone()).build()?;
        let addr = runtime.alloc(8, 8)?;
        let mutex = Arc::new(TracingMutex::new(()));

        let handles = (0..4)
            .map(|i| {
                let mutex = mutex.clone();
                runtime.spawn(move || {
                    let _guard = mutex.lock();
                    tmgmt::with_current(|t| t.write(0x100 + i, addr, 8))
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        for handle in handles {
            handle.join()??;
        }

        assert!(sink.is_empty());
        runtime.shutdown()?;
        Ok(())
    }
}
