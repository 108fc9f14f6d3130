use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    flags::Flags,
    ignore_set::IgnoreSet,
    shadow::Shadow,
    stack_depot::StackId,
    trace::MutexDesc,
};

/// What kind of bug a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// Two concurrent conflicting accesses.
    DataRace,
    /// An access concurrent with the release of the memory it touches.
    UseAfterFree,
}

/// One side of a reported race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedAccess {
    pub tid: u32,
    pub epoch: u64,
    pub addr: u64,
    pub size: u64,
    pub is_write: bool,
    pub is_atomic: bool,
    /// Call stack of the access, outermost frame first. The last entry is the
    /// pc of the access itself.
    pub stack: Vec<u64>,
    pub stack_id: StackId,
    /// Mutexes held by the thread at the time of the access.
    pub mutexes: Vec<MutexDesc>,
}

impl ReportedAccess {
    pub(crate) fn from_shadow(
        cell_addr: u64,
        word: Shadow,
        stack: Vec<u64>,
        stack_id: StackId,
        mutexes: Vec<MutexDesc>,
    ) -> Self {
        Self {
            tid: word.tid(),
            epoch: word.epoch(),
            addr: cell_addr + word.addr0(),
            size: word.size(),
            is_write: word.is_write(),
            is_atomic: word.is_atomic(),
            stack,
            stack_id,
            mutexes,
        }
    }

    fn end(&self) -> u64 {
        self.addr + self.size
    }
}

/// A detected race, as handed to a [`ReportSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceReport {
    pub kind: ReportKind,
    /// The access that detected the race.
    pub current: ReportedAccess,
    /// The earlier access it conflicts with.
    pub previous: ReportedAccess,
}

impl RaceReport {
    /// The smallest address range covering both accesses.
    pub fn addr_range(&self) -> (u64, u64) {
        (
            self.current.addr.min(self.previous.addr),
            self.current.end().max(self.previous.end()),
        )
    }
}

/// Receives the reports that survive suppression and deduplication.
pub trait ReportSink: Send + Sync {
    fn on_report(&self, report: &RaceReport);
}

/// A sink that logs every report as a warning.
pub struct LogSink;

impl ReportSink for LogSink {
    fn on_report(&self, report: &RaceReport) {
        let access = |a: &ReportedAccess| {
            format!(
                "{} of size {} at {:#x} by thread T{}{} (stack {:x?})",
                if a.is_write { "write" } else { "read" },
                a.size,
                a.addr,
                a.tid,
                if a.is_atomic { " (atomic)" } else { "" },
                a.stack,
            )
        };
        let what = match report.kind {
            ReportKind::DataRace => "data race",
            ReportKind::UseAfterFree => "heap-use-after-free",
        };
        log::warn!(
            "{what}: {} conflicts with previous {}",
            access(&report.current),
            access(&report.previous)
        );
    }
}

/// A sink that keeps every report in memory.
#[derive(Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<RaceReport>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all reports received so far.
    pub fn reports(&self) -> Vec<RaceReport> {
        self.reports.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReportSink for CollectingSink {
    fn on_report(&self, report: &RaceReport) {
        self.reports.lock().push(report.clone());
    }
}

/// Filters race reports and forwards the remaining ones to a sink.
pub struct Reporter {
    sink: Arc<dyn ReportSink>,
    racy_stacks: Mutex<HashSet<(StackId, StackId)>>,
    racy_ranges: Mutex<Vec<(u64, u64)>>,
    reported: AtomicUsize,
}

impl Reporter {
    pub fn new(sink: Arc<dyn ReportSink>) -> Self {
        Self {
            sink,
            racy_stacks: Mutex::new(HashSet::new()),
            racy_ranges: Mutex::new(Vec::new()),
            reported: AtomicUsize::new(0),
        }
    }

    /// Number of reports forwarded to the sink.
    pub fn reported(&self) -> usize {
        self.reported.load(Ordering::Relaxed)
    }

    /// Forwards `report` to the sink unless it is suppressed.
    ///
    /// A report is suppressed if the stack of either access is in either of
    /// `ignore_sets`, or, depending on `flags`, if an earlier report had the
    /// same pair of stacks or an overlapping address range.
    ///
    /// Returns `true` if the sink received the report.
    pub fn submit(&self, flags: &Flags, report: RaceReport, ignore_sets: [&IgnoreSet; 2]) -> bool {
        let ids = [report.current.stack_id, report.previous.stack_id];
        if ignore_sets
            .iter()
            .any(|set| ids.iter().any(|id| *id != StackId::NONE && set.contains(*id)))
        {
            log::debug!("Race at {:#x} suppressed by ignore set", report.current.addr);
            return false;
        }

        if flags.suppress_equal_stacks {
            let key = (ids[0].min(ids[1]), ids[0].max(ids[1]));
            if !self.racy_stacks.lock().insert(key) {
                log::debug!("Race at {:#x} suppressed: equal stacks", report.current.addr);
                return false;
            }
        }

        if flags.suppress_equal_addresses {
            let (start, end) = report.addr_range();
            let mut ranges = self.racy_ranges.lock();
            if ranges.iter().any(|(s, e)| start < *e && *s < end) {
                log::debug!("Race at {:#x} suppressed: equal address", report.current.addr);
                return false;
            }
            ranges.push((start, end));
        }

        self.reported.fetch_add(1, Ordering::Relaxed);
        self.sink.on_report(&report);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{flags::Flags, ignore_set::IgnoreSet, stack_depot::StackId};

    use super::{CollectingSink, RaceReport, ReportKind, ReportedAccess, Reporter};

    fn access(tid: u32, addr: u64, size: u64, stack_id: u32) -> ReportedAccess {
        ReportedAccess {
            tid,
            epoch: 1,
            addr,
            size,
            is_write: true,
            is_atomic: false,
            stack: vec![u64::from(stack_id)],
            stack_id: StackId(stack_id),
            mutexes: Vec::new(),
        }
    }

    fn report(addr: u64, stacks: (u32, u32)) -> RaceReport {
        RaceReport {
            kind: ReportKind::DataRace,
            current: access(1, addr, 4, stacks.0),
            previous: access(2, addr, 8, stacks.1),
        }
    }

    #[test]
    fn equal_stacks_are_reported_once() {
        let sink = Arc::new(CollectingSink::new());
        let reporter = Reporter::new(sink.clone());
        let flags = Flags {
            suppress_equal_addresses: false,
            ..Flags::default()
        };
        let empty = IgnoreSet::new();

        assert!(reporter.submit(&flags, report(0x100, (1, 2)), [&empty, &empty]));
        assert!(!reporter.submit(&flags, report(0x200, (2, 1)), [&empty, &empty]));
        assert!(reporter.submit(&flags, report(0x300, (1, 3)), [&empty, &empty]));

        assert_eq!(reporter.reported(), 2);
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn overlapping_addresses_are_reported_once() {
        let sink = Arc::new(CollectingSink::new());
        let reporter = Reporter::new(sink.clone());
        let flags = Flags {
            suppress_equal_stacks: false,
            ..Flags::default()
        };
        let empty = IgnoreSet::new();

        assert!(reporter.submit(&flags, report(0x100, (1, 2)), [&empty, &empty]));
        assert!(!reporter.submit(&flags, report(0x104, (3, 4)), [&empty, &empty]));
        assert!(reporter.submit(&flags, report(0x108, (5, 6)), [&empty, &empty]));
        assert_eq!(
            sink.reports().iter().map(|r| r.addr_range()).collect::<Vec<_>>(),
            vec![(0x100, 0x108), (0x108, 0x110)]
        );
    }

    #[test]
    fn ignore_set_of_either_thread_suppresses() {
        let sink = Arc::new(CollectingSink::new());
        let reporter = Reporter::new(sink.clone());
        let flags = Flags::default();
        let empty = IgnoreSet::new();
        let mut ignored = IgnoreSet::new();
        ignored.add(StackId(2));

        assert!(!reporter.submit(&flags, report(0x100, (1, 2)), [&ignored, &empty]));
        assert!(!reporter.submit(&flags, report(0x100, (2, 1)), [&empty, &ignored]));
        assert!(sink.is_empty());

        // Suppressed reports leave no dedup state behind.
        assert!(reporter.submit(&flags, report(0x100, (1, 2)), [&empty, &empty]));
    }
}
