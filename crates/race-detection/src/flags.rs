use std::io::Read;

use anyhow::{Error, ensure};
use serde::{Deserialize, Serialize};

use crate::trace::TraceGeometry;

/// Runtime options of the detector.
///
/// Missing fields take their default value when deserialized, so a JSON
/// file only needs to name the options it changes.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Flags {
    /// Report detected races at all.
    pub report_bugs: bool,

    /// Report races where at least one access is atomic.
    pub report_atomic_races: bool,

    /// Report each pair of racing stacks only once.
    pub suppress_equal_stacks: bool,

    /// Report each racy memory range only once.
    pub suppress_equal_addresses: bool,

    /// Per-thread history length, within `0..=7`. Each step doubles the
    /// number of remembered events, starting at 16K events for `0`.
    pub history_size: u32,

    /// Number of finished thread slots kept back before one is reused.
    pub thread_quarantine_size: usize,
}

impl Flags {
    /// Parses flags from JSON.
    ///
    /// # Errors
    ///
    /// Fails on malformed JSON, unknown fields, or values rejected by
    /// [`Flags::validate`].
    pub fn from_json<R: Read>(reader: R) -> Result<Self, Error> {
        let flags: Flags = serde_json::from_reader(reader)?;
        flags.validate()?;
        Ok(flags)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks that all values are within their valid ranges.
    pub fn validate(&self) -> Result<(), Error> {
        ensure!(
            self.history_size <= 7,
            "history_size must be within 0..=7, got {}",
            self.history_size
        );
        Ok(())
    }

    /// The trace geometry selected by `history_size`.
    pub fn trace_geometry(&self) -> Result<TraceGeometry, Error> {
        TraceGeometry::from_history_size(self.history_size)
    }
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            report_bugs: true,
            report_atomic_races: true,
            suppress_equal_stacks: true,
            suppress_equal_addresses: true,
            history_size: 2,
            thread_quarantine_size: 16,
        }
    }
}
