use std::{
    panic::Location,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
};

use anyhow::{Error, anyhow, ensure};
use race_detection::{Context, Flags, ReportSink, ThreadHandle};

use crate::tmgmt;

/// Start of the monitored address range handed out by [`Runtime::alloc`].
pub const DEFAULT_HEAP_BASE: u64 = 0x1_0000;
/// Size of the monitored address range.
pub const DEFAULT_HEAP_SIZE: u64 = 1 << 20;

/// Turns a call site into the program counter recorded by the detector.
pub(crate) fn pc_of(location: &'static Location<'static>) -> u64 {
    location as *const Location<'static> as u64
}

/// Records an event on the current thread, logging instead of failing if the
/// thread is not instrumented.
pub(crate) fn record(f: impl FnOnce(&mut race_detection::ThreadState)) {
    if let Err(err) = tmgmt::with_current(f) {
        log::debug!("Dropping event of an uninstrumented thread: {err}");
    }
}

/// Hands out addresses of the monitored range. Memory is never reused.
struct Heap {
    next: AtomicU64,
    end: u64,
}

impl Heap {
    fn alloc(&self, size: u64, align: u64) -> Result<u64, Error> {
        ensure!(align.is_power_of_two(), "Alignment {align} is not a power of two");
        let mut addr = 0;
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                addr = next.checked_add(align - 1)? & !(align - 1);
                let end = addr.checked_add(size)?;
                (end <= self.end).then_some(end)
            })
            .map_err(|_| anyhow!("Monitored heap exhausted allocating {size} bytes"))?;
        Ok(addr)
    }
}

/// Runs closures on instrumented threads under a shared race detector.
///
/// Building a runtime installs the detector state of the calling thread, which
/// becomes the main thread of the monitored program. Threads created through
/// [`Runtime::spawn`] are instrumented as well. Call [`Runtime::shutdown`] on
/// the main thread once all of them are joined.
pub struct Runtime {
    ctx: Arc<Context>,
    heap: Arc<Heap>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Allocates `size` bytes of monitored memory aligned to `align`.
    ///
    /// The shadow of the new memory is cleared, so accesses made to an earlier
    /// allocation at the same address are forgotten.
    ///
    /// # Errors
    ///
    /// Fails if `align` is not a power of two or the monitored range is used
    /// up.
    pub fn alloc(&self, size: u64, align: u64) -> Result<u64, Error> {
        let addr = self.heap.alloc(size, align)?;
        self.ctx.shadow().reset_range(addr, size);
        Ok(addr)
    }

    /// Records the release of `[addr, addr + size)` by the current thread.
    #[track_caller]
    pub fn free(&self, addr: u64, size: u64) {
        let pc = pc_of(Location::caller());
        record(|t| t.memory_range_freed(pc, addr, size));
    }

    /// Spawns an instrumented thread. See [`spawn`].
    pub fn spawn<F, T>(&self, f: F) -> Result<TracedJoinHandle<T>, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        spawn(f)
    }

    /// Finishes the main thread and returns the number of reported races.
    ///
    /// # Errors
    ///
    /// Fails if called on a thread without an installed detector state.
    pub fn shutdown(self) -> Result<usize, Error> {
        tmgmt::take_current()?.finish();
        let reported = self.ctx.reported();
        log::info!("Shut down with {reported} reported race(s)");
        Ok(reported)
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    base: u64,
    size: u64,
    flags: Flags,
    sink: Option<Arc<dyn ReportSink>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            base: DEFAULT_HEAP_BASE,
            size: DEFAULT_HEAP_SIZE,
            flags: Flags::default(),
            sink: None,
        }
    }

    /// Sets the monitored address range.
    pub fn heap(mut self, base: u64, size: u64) -> Self {
        self.base = base;
        self.size = size;
        self
    }

    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Consumes this builder to create a new [`Runtime`] and installs the main
    /// thread on the calling thread.
    ///
    /// # Errors
    ///
    /// Fails on invalid flags or heap range, or if the calling thread is
    /// already instrumented.
    pub fn build(self) -> Result<Runtime, Error> {
        let mut builder = Context::builder(self.base, self.size).flags(self.flags);
        if let Some(sink) = self.sink {
            builder = builder.sink(sink);
        }
        let ctx = builder.build()?;
        tmgmt::set_current(ctx.main_thread()?)?;

        let heap = Arc::new(Heap {
            next: AtomicU64::new(ctx.shadow().base()),
            end: ctx.shadow().base() + ctx.shadow().len(),
        });

        Ok(Runtime { ctx, heap })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An owned permission to join an instrumented thread.
pub struct TracedJoinHandle<T> {
    inner: JoinHandle<Result<T, Error>>,
    thread: ThreadHandle,
}

impl<T> TracedJoinHandle<T> {
    /// Detector id of the thread.
    pub fn tid(&self) -> u32 {
        self.thread.tid()
    }

    /// Waits for the thread to finish and synchronizes the current thread with
    /// everything it did.
    ///
    /// # Errors
    ///
    /// Fails if the thread panicked, could not install its detector state, or
    /// the current thread is not instrumented.
    pub fn join(self) -> Result<T, Error> {
        let tid = self.thread.tid();
        let result = self
            .inner
            .join()
            .map_err(|_| anyhow!("Thread T{tid} panicked"))??;
        tmgmt::with_current(|t| t.join(&self.thread))??;
        Ok(result)
    }
}

/// Spawns an OS thread running `f` as a child of the current thread.
///
/// Everything the current thread did before the call happens before `f`.
///
/// # Errors
///
/// Fails if the current thread is not instrumented, no detector slot is left,
/// or the OS thread can not be spawned.
pub fn spawn<F, T>(f: F) -> Result<TracedJoinHandle<T>, Error>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let forked = tmgmt::with_current(|t| t.fork())??;
    let thread = forked.handle();

    let inner = std::thread::Builder::new()
        .name(format!("T{}", forked.tid()))
        .spawn(move || -> Result<T, Error> {
            tmgmt::set_current(forked.start())?;
            let result = f();
            tmgmt::take_current()?.finish();
            Ok(result)
        })?;

    Ok(TracedJoinHandle { inner, thread })
}

/// Marks a function frame on the current thread until dropped.
pub struct FrameGuard(());

/// Enters a function frame at the call site.
#[track_caller]
pub fn frame() -> FrameGuard {
    let pc = pc_of(Location::caller());
    record(|t| t.func_entry(pc));
    FrameGuard(())
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        record(|t| t.func_exit());
    }
}

/// Keeps the current thread in an ignore region until dropped.
pub struct IgnoreGuard(());

/// Stops recording accesses of the current thread until the guard is dropped.
#[track_caller]
pub fn ignore_accesses() -> IgnoreGuard {
    let pc = pc_of(Location::caller());
    record(|t| t.ignore_begin(pc));
    IgnoreGuard(())
}

impl Drop for IgnoreGuard {
    fn drop(&mut self) {
        record(|t| t.ignore_end());
    }
}
