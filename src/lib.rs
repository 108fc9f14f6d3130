//! Runs small multithreaded programs under the `race_detection` detector.
//!
//! A [`Runtime`] installs the detector on the calling thread and hands out
//! monitored memory. Threads spawned through it are instrumented
//! automatically; [`TracedCell`] and [`TracingMutex`] report their accesses
//! and lock events to the thread that uses them.
//!
//! # Examples
//! ```no_run
//! # use anyhow::Error;
//! # fn main() -> Result<(), Error> {
//! use std::sync::Arc;
//!
//! use racegrind::{Runtime, TracedCell};
//!
//! let runtime = Runtime::builder().build()?;
//! let cell = Arc::new(TracedCell::new(&runtime, 0)?);
//!
//! let child = {
//!     let cell = cell.clone();
//!     runtime.spawn(move || cell.set(1))?
//! };
//! cell.set(2);
//! child.join()?;
//!
//! println!("{} race(s) reported", runtime.shutdown()?);
//! # Ok(())
//! # }
//! ```

mod cell;
mod mutex;
/// Instrumented threads and monitored memory.
pub mod runtime;
/// Demo programs for the command line.
pub mod scenario;
pub mod tmgmt;

pub use cell::TracedCell;
pub use mutex::{TracingMutex, TracingRawMutex};
pub use runtime::{Runtime, RuntimeBuilder, TracedJoinHandle, frame, ignore_accesses, spawn};
pub use scenario::Scenario;
