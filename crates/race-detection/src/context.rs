use std::sync::Arc;

use anyhow::Error;

use crate::{
    flags::Flags,
    report::{LogSink, ReportSink, Reporter},
    shadow::ShadowMemory,
    stack_depot::StackDepot,
    sync::SyncTab,
    thread::{ThreadRegistry, ThreadState},
    trace::TraceGeometry,
};

/// State shared by all threads of one monitored program.
pub struct Context {
    pub(crate) flags: Flags,
    pub(crate) shadow: ShadowMemory,
    pub(crate) registry: ThreadRegistry,
    pub(crate) syncs: SyncTab,
    pub(crate) depot: StackDepot,
    pub(crate) reporter: Reporter,
}

impl Context {
    pub fn builder(base: u64, len: u64) -> ContextBuilder {
        ContextBuilder::new(base, len)
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn shadow(&self) -> &ShadowMemory {
        &self.shadow
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn depot(&self) -> &StackDepot {
        &self.depot
    }

    pub fn syncs(&self) -> &SyncTab {
        &self.syncs
    }

    /// Number of races reported so far.
    pub fn reported(&self) -> usize {
        self.reporter.reported()
    }

    /// Starts a thread that has no parent, usually the main thread of the
    /// program.
    ///
    /// # Errors
    ///
    /// Fails if no thread slot is available.
    pub fn main_thread(self: &Arc<Self>) -> Result<ThreadState, Error> {
        let thread = self.registry.create()?;
        Ok(ThreadState::start(self.clone(), thread))
    }
}

/// Builder for [`Context`].
///
/// Only the monitored address range is required. Without further settings
/// the context uses [`Flags::default`], derives the trace geometry from the
/// flags, and logs reports through [`LogSink`].
pub struct ContextBuilder {
    base: u64,
    len: u64,
    flags: Flags,
    geometry: Option<TraceGeometry>,
    sink: Option<Arc<dyn ReportSink>>,
}

impl ContextBuilder {
    /// Starts a context monitoring `[base, base + len)`.
    pub fn new(base: u64, len: u64) -> Self {
        Self {
            base,
            len,
            flags: Flags::default(),
            geometry: None,
            sink: None,
        }
    }

    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Overrides the trace geometry derived from `history_size`.
    pub fn trace_geometry(mut self, geometry: TraceGeometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Consumes this builder to create a new [`Context`].
    ///
    /// # Errors
    ///
    /// Fails on invalid flags or an address range [`ShadowMemory::new`]
    /// rejects.
    pub fn build(self) -> Result<Arc<Context>, Error> {
        self.flags.validate()?;
        let geometry = match self.geometry {
            Some(geometry) => geometry,
            None => self.flags.trace_geometry()?,
        };
        let sink = self.sink.unwrap_or_else(|| Arc::new(LogSink));
        let shadow = ShadowMemory::new(self.base, self.len)?;

        log::info!(
            "Monitoring {:#x}..{:#x} with {} trace parts of {} events",
            shadow.base(),
            shadow.base() + shadow.len(),
            geometry.parts,
            geometry.part_size
        );

        Ok(Arc::new(Context {
            shadow,
            registry: ThreadRegistry::new(geometry, self.flags.thread_quarantine_size),
            syncs: SyncTab::new(),
            depot: StackDepot::new(),
            reporter: Reporter::new(sink),
            flags: self.flags,
        }))
    }
}
