//! Happens-before data race detection over shadow memory.
//!
//! Every 8-byte cell of the monitored memory range owns four shadow words,
//! each recording one earlier access: who made it, when, which bytes, and
//! how. A new access is checked against the words of its cell and races with
//! any conflicting access that does not happen before it according to the
//! vector clock of the accessing thread.
//!
//! Threads keep a compact trace of their recent events, so that the call
//! stack and held mutexes of the earlier access in a race can be
//! reconstructed when the race is reported.
//!
//! A [`Context`] holds everything shared by the threads of one program. Each
//! thread drives the detector through its own [`ThreadState`].

pub mod clock;
mod context;
/// Detector options
pub mod flags;
pub mod ignore_set;
/// Race reports and their filtering
pub mod report;
pub mod shadow;
pub mod stack_depot;
/// Synchronization objects
pub mod sync;
pub mod thread;
/// Per-thread event history
pub mod trace;

pub use context::{Context, ContextBuilder};
pub use flags::Flags;
pub use report::{CollectingSink, LogSink, RaceReport, ReportKind, ReportSink};
pub use thread::{ForkedThread, ThreadHandle, ThreadState};
