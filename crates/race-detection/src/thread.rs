use std::{
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Error;

use crate::{
    clock::VectorClock,
    context::Context,
    report::{RaceReport, ReportKind, ReportedAccess},
    shadow::{
        MAX_EPOCH, SHADOW_CELL, Shadow,
        memory::store_shadow,
        update::{Access, contains_same_access, update_cell},
    },
    stack_depot::StackId,
    trace::{Event, EventType, MutexSet, ShadowStack},
};

mod registry;

pub use registry::{ThreadContext, ThreadRegistry, ThreadStatus};

/// Refers to a thread from another thread, e.g. to join it.
#[derive(Clone)]
pub struct ThreadHandle {
    thread: Arc<ThreadContext>,
}

impl ThreadHandle {
    pub fn tid(&self) -> u32 {
        self.thread.tid()
    }

    pub fn status(&self) -> ThreadStatus {
        self.thread.status()
    }
}

/// A thread that was forked but has not started running yet.
///
/// Hand it to the new OS thread and call [`ForkedThread::start`] there.
pub struct ForkedThread {
    ctx: Arc<Context>,
    thread: Arc<ThreadContext>,
}

impl ForkedThread {
    pub fn tid(&self) -> u32 {
        self.thread.tid()
    }

    pub fn handle(&self) -> ThreadHandle {
        ThreadHandle {
            thread: self.thread.clone(),
        }
    }

    /// Starts the thread, synchronizing with everything its parent did before
    /// the fork.
    pub fn start(self) -> ThreadState {
        ThreadState::start(self.ctx, self.thread)
    }
}

fn is_acquire(order: Ordering) -> bool {
    matches!(order, Ordering::Acquire | Ordering::AcqRel | Ordering::SeqCst)
}

fn is_release(order: Ordering) -> bool {
    matches!(order, Ordering::Release | Ordering::AcqRel | Ordering::SeqCst)
}

fn size_log_of(size: u64) -> Option<u32> {
    match size {
        1 => Some(0),
        2 => Some(1),
        4 => Some(2),
        8 => Some(3),
        _ => None,
    }
}

/// The detector state owned by one running thread.
///
/// Every instrumented event of the thread goes through one of the methods
/// below. Each method takes `&mut self`, so a `ThreadState` is only ever used
/// by the thread it belongs to. Whatever other threads need to see lives in
/// the shared [`ThreadContext`].
pub struct ThreadState {
    ctx: Arc<Context>,
    thread: Arc<ThreadContext>,
    tid: u32,
    epoch: u64,
    /// Epoch of the last release. Accesses recorded before it are no longer
    /// private to this thread.
    fast_synch_epoch: u64,
    ignore_depth: u32,
    clock: VectorClock,
    shadow_stack: ShadowStack,
    mset: MutexSet,
}

impl ThreadState {
    pub(crate) fn start(ctx: Arc<Context>, thread: Arc<ThreadContext>) -> Self {
        let tid = thread.tid();
        let epoch = thread.epoch0();

        let mut clock = VectorClock::new();
        clock.acquire(&thread.sync.lock());
        clock.set(tid, epoch);

        let shadow_stack = ShadowStack::default();
        let mset = MutexSet::new();
        thread.trace.switch_part(epoch, &shadow_stack, &mset);
        ctx.registry.started(&thread);
        log::debug!("Thread T{tid} started at epoch {epoch}");

        Self {
            ctx,
            thread,
            tid,
            epoch,
            fast_synch_epoch: epoch,
            ignore_depth: 0,
            clock,
            shadow_stack,
            mset,
        }
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// The current epoch of this thread.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn mutex_set(&self) -> &MutexSet {
        &self.mset
    }

    /// Current call stack, outermost frame first.
    pub fn stack(&self) -> &[u64] {
        self.shadow_stack.frames()
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn handle(&self) -> ThreadHandle {
        ThreadHandle {
            thread: self.thread.clone(),
        }
    }

    /// `true` while the thread is inside an ignore region.
    pub fn ignores_accesses(&self) -> bool {
        self.ignore_depth > 0
    }

    // ------------------------------------------------------------------------
    // Trace

    fn trace_event(
        thread: &ThreadContext,
        epoch: u64,
        stack: &ShadowStack,
        mset: &MutexSet,
        typ: EventType,
        payload: u64,
    ) {
        let trace = &thread.trace;
        if trace.geometry().starts_part(epoch) {
            trace.switch_part(epoch, stack, mset);
        }
        trace.store_event(epoch, Event::new(typ, payload));
    }

    /// Moves to the next epoch and records `typ` as its event.
    fn add_event(&mut self, typ: EventType, payload: u64) {
        debug_assert!(self.epoch < MAX_EPOCH, "epoch of T{} overflows", self.tid);
        self.epoch += 1;
        Self::trace_event(
            &self.thread,
            self.epoch,
            &self.shadow_stack,
            &self.mset,
            typ,
            payload,
        );
    }

    pub fn func_entry(&mut self, pc: u64) {
        self.add_event(EventType::FuncEnter, pc);
        self.shadow_stack.push(pc);
    }

    pub fn func_exit(&mut self) {
        self.add_event(EventType::FuncExit, 0);
        self.shadow_stack.pop();
    }

    /// Interns the current call stack topped by `pc`.
    pub fn stack_id(&self, pc: u64) -> StackId {
        self.ctx.depot.put(&self.shadow_stack.snapshot(pc))
    }

    // ------------------------------------------------------------------------
    // Memory accesses

    fn shadow_of(&self, addr: u64, size_log: u32, is_write: bool, is_atomic: bool) -> Shadow {
        let mut cur = Shadow::new(self.tid, self.epoch);
        cur.set_addr0_and_size_log(addr % SHADOW_CELL, size_log);
        cur.set_write(is_write);
        cur.set_atomic(is_atomic);
        cur
    }

    fn check_cell(&self, pc: u64, cell_addr: u64, cell: &[AtomicU64], cur: Shadow, access: Access) {
        if let ControlFlow::Break(old) = update_cell(cell, cur, access, &self.clock) {
            self.report_race(pc, cell_addr, cur, old);
        }
    }

    /// Checks and records an access of `1 << size_log` bytes at `addr`.
    ///
    /// The access must not cross a shadow cell boundary. Accesses outside the
    /// monitored range and accesses inside an ignore region are dropped.
    pub fn memory_access(
        &mut self,
        pc: u64,
        addr: u64,
        size_log: u32,
        is_write: bool,
        is_atomic: bool,
    ) {
        debug_assert!(size_log <= 3);
        debug_assert!(addr % SHADOW_CELL + (1 << size_log) <= SHADOW_CELL);

        if self.ignore_depth > 0 {
            return;
        }
        let Some(cell) = self.ctx.shadow.cell(addr) else {
            return;
        };

        let cur = self.shadow_of(addr, size_log, is_write, is_atomic);
        if contains_same_access(cell, cur, self.fast_synch_epoch) {
            return;
        }

        self.epoch += 1;
        Self::trace_event(
            &self.thread,
            self.epoch,
            &self.shadow_stack,
            &self.mset,
            EventType::Mop,
            pc,
        );

        let mut cur = cur;
        cur.set_epoch(self.epoch);
        let access = Access {
            is_write,
            is_atomic,
            size_log,
        };
        self.check_cell(pc, addr - addr % SHADOW_CELL, cell, cur, access);
    }

    pub fn read(&mut self, pc: u64, addr: u64, size: u64) {
        self.sized_access(pc, addr, size, false);
    }

    pub fn write(&mut self, pc: u64, addr: u64, size: u64) {
        self.sized_access(pc, addr, size, true);
    }

    fn sized_access(&mut self, pc: u64, addr: u64, size: u64, is_write: bool) {
        match size_log_of(size) {
            Some(size_log) if addr % SHADOW_CELL + size <= SHADOW_CELL => {
                self.memory_access(pc, addr, size_log, is_write, false)
            }
            _ if size <= SHADOW_CELL => self.unaligned_access(pc, addr, size, is_write),
            _ => self.memory_access_range(pc, addr, size, is_write),
        }
    }

    /// Splits an access that may cross a cell boundary into pieces that do
    /// not, taking the widest piece that fits at each step.
    pub fn unaligned_access(&mut self, pc: u64, addr: u64, size: u64, is_write: bool) {
        let same_cell = |a: u64, len: u64| a % SHADOW_CELL + len <= SHADOW_CELL;

        let mut addr = addr;
        let mut size = size;
        while size > 0 {
            let (piece, size_log) = if size >= 8 && same_cell(addr, 8) {
                (8, 3)
            } else if size >= 4 && same_cell(addr, 4) {
                (4, 2)
            } else if size >= 2 && same_cell(addr, 2) {
                (2, 1)
            } else {
                (1, 0)
            };
            self.memory_access(pc, addr, size_log, is_write, false);
            addr = addr.wrapping_add(piece);
            size -= piece;
        }
    }

    /// Checks and records a plain access to `[addr, addr + size)`.
    ///
    /// The whole range shares one epoch and one trace event. Unaligned head and
    /// tail bytes are checked one at a time, the aligned middle cell by cell.
    pub fn memory_access_range(&mut self, pc: u64, addr: u64, size: u64, is_write: bool) {
        if size == 0 || self.ignore_depth > 0 {
            return;
        }
        let shadow = &self.ctx.shadow;
        let start = addr.max(shadow.base());
        let end = addr
            .saturating_add(size)
            .min(shadow.base() + shadow.len());
        if start >= end {
            return;
        }

        self.add_event(EventType::Mop, pc);

        let mut addr = start;
        while addr % SHADOW_CELL != 0 && addr < end {
            self.range_access(pc, addr, 0, is_write);
            addr += 1;
        }
        while end - addr >= SHADOW_CELL {
            self.range_access(pc, addr, 3, is_write);
            addr += SHADOW_CELL;
        }
        while addr < end {
            self.range_access(pc, addr, 0, is_write);
            addr += 1;
        }
    }

    fn range_access(&self, pc: u64, addr: u64, size_log: u32, is_write: bool) {
        let Some(cell) = self.ctx.shadow.cell(addr) else {
            return;
        };
        let cur = self.shadow_of(addr, size_log, is_write, false);
        let access = Access {
            is_write,
            is_atomic: false,
            size_log,
        };
        self.check_cell(pc, addr - addr % SHADOW_CELL, cell, cur, access);
    }

    /// Records the release of `[addr, addr + size)`.
    ///
    /// The range is checked like a write. Afterwards every cell keeps a single
    /// freed word, so that any later access from a thread not synchronized
    /// with this one is reported as a use after free.
    pub fn memory_range_freed(&mut self, pc: u64, addr: u64, size: u64) {
        if size == 0 || self.ignore_depth > 0 {
            return;
        }
        self.memory_access_range(pc, addr, size, true);

        let mut freed = Shadow::new(self.tid, self.epoch);
        freed.set_addr0_and_size_log(0, 3);
        freed.set_write(true);
        freed.mark_as_freed();

        self.ctx.shadow.for_each_cell(addr, size, |cell| {
            store_shadow(&cell[0], freed);
            for word in &cell[1..] {
                store_shadow(word, Shadow::EMPTY);
            }
        });
    }

    /// Forgets all accesses recorded for `[addr, addr + size)`, e.g. when the
    /// memory is handed out by an allocator again.
    pub fn memory_reset_range(&self, addr: u64, size: u64) {
        self.ctx.shadow.reset_range(addr, size);
    }

    // ------------------------------------------------------------------------
    // Synchronization

    fn acquire_clock(&mut self, sync: &VectorClock) {
        self.clock.set(self.tid, self.epoch);
        self.clock.acquire(sync);
    }

    fn release_clock(&mut self, sync: &mut VectorClock) {
        self.clock.set(self.tid, self.epoch);
        self.fast_synch_epoch = self.epoch;
        self.clock.release(sync);
    }

    fn release_store_clock(&mut self, sync: &mut VectorClock) {
        self.clock.set(self.tid, self.epoch);
        self.fast_synch_epoch = self.epoch;
        self.clock.release_store(sync);
    }

    pub fn mutex_lock(&mut self, pc: u64, addr: u64) {
        self.memory_access(pc, addr, 0, false, true);
        self.add_event(EventType::Lock, addr);
        self.mset.add(addr, true, self.epoch);

        let var = self.ctx.syncs.get_or_create(addr);
        let var = var.lock();
        self.acquire_clock(&var.clock);
        self.clock.acquire(&var.read_clock);
    }

    pub fn mutex_unlock(&mut self, pc: u64, addr: u64) {
        self.memory_access(pc, addr, 0, false, true);
        self.add_event(EventType::Unlock, addr);
        self.mset.del(addr);

        let var = self.ctx.syncs.get_or_create(addr);
        self.release_store_clock(&mut var.lock().clock);
    }

    pub fn mutex_read_lock(&mut self, pc: u64, addr: u64) {
        self.memory_access(pc, addr, 0, false, true);
        self.add_event(EventType::RLock, addr);
        self.mset.add(addr, false, self.epoch);

        let var = self.ctx.syncs.get_or_create(addr);
        self.acquire_clock(&var.lock().clock);
    }

    pub fn mutex_read_unlock(&mut self, pc: u64, addr: u64) {
        self.memory_access(pc, addr, 0, false, true);
        self.add_event(EventType::RUnlock, addr);
        self.mset.del(addr);

        let var = self.ctx.syncs.get_or_create(addr);
        self.release_clock(&mut var.lock().read_clock);
    }

    /// Records the destruction of the mutex at `addr`. This counts as a write
    /// of the mutex memory, so destroying a mutex still in use races.
    pub fn mutex_destroy(&mut self, pc: u64, addr: u64) {
        self.memory_access(pc, addr, 0, true, false);
        self.ctx.syncs.remove(addr);
        self.mset.remove(addr);
    }

    /// Synchronizes with every release on `addr`.
    pub fn acquire(&mut self, addr: u64) {
        if let Some(var) = self.ctx.syncs.get(addr) {
            self.acquire_clock(&var.lock().clock);
        }
    }

    /// Publishes everything this thread did so far on `addr`.
    pub fn release(&mut self, addr: u64) {
        let var = self.ctx.syncs.get_or_create(addr);
        self.add_event(EventType::Mop, 0);
        self.release_clock(&mut var.lock().clock);
    }

    pub fn atomic_load(&mut self, pc: u64, addr: u64, size_log: u32, order: Ordering) {
        self.memory_access(pc, addr, size_log, false, true);
        if !is_acquire(order) {
            return;
        }
        let var = self.ctx.syncs.get_or_create(addr);
        self.acquire_clock(&var.lock().clock);
    }

    pub fn atomic_store(&mut self, pc: u64, addr: u64, size_log: u32, order: Ordering) {
        self.memory_access(pc, addr, size_log, true, true);
        if !is_release(order) {
            return;
        }
        let var = self.ctx.syncs.get_or_create(addr);
        self.add_event(EventType::Mop, 0);
        self.release_store_clock(&mut var.lock().clock);
    }

    /// Read-modify-write, e.g. a fetch-add or a successful compare-exchange.
    pub fn atomic_rmw(&mut self, pc: u64, addr: u64, size_log: u32, order: Ordering) {
        self.memory_access(pc, addr, size_log, true, true);
        if order == Ordering::Relaxed {
            return;
        }
        let var = self.ctx.syncs.get_or_create(addr);
        let mut var = var.lock();
        self.add_event(EventType::Mop, 0);
        if is_acquire(order) {
            self.acquire_clock(&var.clock);
        }
        if is_release(order) {
            self.release_clock(&mut var.clock);
        }
    }

    // ------------------------------------------------------------------------
    // Ignores

    /// Enters an ignore region. Accesses are not recorded until the matching
    /// [`ThreadState::ignore_end`], and races with the current stack are
    /// suppressed meanwhile.
    pub fn ignore_begin(&mut self, pc: u64) {
        self.ignore_depth += 1;
        let id = self.stack_id(pc);
        self.thread.ignore_set.lock().add(id);
        log::trace!("T{} enters ignore region {}", self.tid, self.ignore_depth);
    }

    pub fn ignore_end(&mut self) {
        if self.ignore_depth == 0 {
            log::warn!("T{} leaves an ignore region it never entered", self.tid);
            return;
        }
        self.ignore_depth -= 1;
        if self.ignore_depth == 0 {
            self.thread.ignore_set.lock().reset();
        }
    }

    /// Suppresses races involving the stack `id` until the thread leaves its
    /// current ignore region.
    pub fn suppress_stack(&mut self, id: StackId) {
        self.thread.ignore_set.lock().add(id);
    }

    // ------------------------------------------------------------------------
    // Thread lifecycle

    /// Creates a child thread that starts after everything this thread did
    /// so far.
    ///
    /// # Errors
    ///
    /// Fails if no thread slot is available.
    pub fn fork(&mut self) -> Result<ForkedThread, Error> {
        let child = self.ctx.registry.create()?;
        self.add_event(EventType::Mop, 0);
        self.release_clock(&mut child.sync.lock());
        log::debug!("T{} forked T{}", self.tid, child.tid());

        Ok(ForkedThread {
            ctx: self.ctx.clone(),
            thread: child,
        })
    }

    /// Waits for nothing, but synchronizes with everything the finished thread
    /// behind `handle` did.
    ///
    /// # Errors
    ///
    /// Fails if that thread has not finished, is detached, or was joined
    /// already.
    pub fn join(&mut self, handle: &ThreadHandle) -> Result<(), Error> {
        self.ctx.registry.joined(&handle.thread)?;
        self.acquire_clock(&handle.thread.sync.lock());
        log::debug!("T{} joined T{}", self.tid, handle.tid());
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if the thread behind `handle` was joined or detached already.
    pub fn detach(&mut self, handle: &ThreadHandle) -> Result<(), Error> {
        self.ctx.registry.detached(&handle.thread)
    }

    /// Ends this thread and publishes its history to a later joiner.
    pub fn finish(mut self) {
        if self.ignore_depth > 0 {
            let stacks: Vec<_> = self
                .thread
                .ignore_set
                .lock()
                .iter()
                .filter_map(|id| self.ctx.depot.get(id))
                .collect();
            log::warn!(
                "Thread T{} finished with ignores enabled, ignore regions entered at {:x?}",
                self.tid,
                stacks
            );
        }

        self.add_event(EventType::Mop, 0);
        let thread = self.thread.clone();
        self.release_clock(&mut thread.sync.lock());
        self.ctx.registry.finished(&thread, self.epoch);
        log::debug!("Thread T{} finished at epoch {}", self.tid, self.epoch);
    }

    // ------------------------------------------------------------------------
    // Reporting

    fn report_race(&self, pc: u64, cell_addr: u64, cur: Shadow, old: Shadow) {
        let ctx = &self.ctx;
        if !ctx.flags.report_bugs {
            return;
        }
        if (cur.is_atomic() || old.is_atomic()) && !ctx.flags.report_atomic_races {
            return;
        }

        let Some(previous) = ctx.registry.get(old.tid()) else {
            log::debug!("Dropping race with unknown thread T{}", old.tid());
            return;
        };
        let Some(restored) = previous.trace.restore(old.epoch()) else {
            log::debug!(
                "Dropping race at {:#x}: history of T{} at epoch {} is gone",
                cell_addr + cur.addr0(),
                old.tid(),
                old.epoch()
            );
            return;
        };

        let stack = self.shadow_stack.snapshot(pc);
        let stack_id = ctx.depot.put(&stack);
        let prev_stack_id = ctx.depot.put(&restored.stack);

        let report = RaceReport {
            kind: if old.is_freed() {
                ReportKind::UseAfterFree
            } else {
                ReportKind::DataRace
            },
            current: ReportedAccess::from_shadow(
                cell_addr,
                cur,
                stack,
                stack_id,
                self.mset.iter().copied().collect(),
            ),
            previous: ReportedAccess::from_shadow(
                cell_addr,
                old,
                restored.stack,
                prev_stack_id,
                restored.mset.iter().copied().collect(),
            ),
        };

        let own = self.thread.ignore_set();
        let other = previous.ignore_set();
        ctx.reporter.submit(&ctx.flags, report, [&own, &other]);
    }
}
