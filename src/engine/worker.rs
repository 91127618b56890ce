//! MCA worker thread.
//!
//! Pops spills off the shared queue and folds them into the histogram sink until it
//! sees a terminator or the cancel flag. The worker is the last owner of every spill.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::histogram::SharedSink;
use crate::queue::Popped;
use crate::source::SpillSender;
use crate::spill::{Spill, SpillKind};

/// Name of the worker thread.
pub const WORKER_THREAD_NAME: &str = "mca-worker";

/// What the worker consumed during one acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Spills carrying hits.
    pub data_spills: u64,
    /// Counter-only spills.
    pub stats_spills: u64,
    /// RunStart and RunStop markers.
    pub run_markers: u64,
    /// Hits folded into the sink.
    pub hits: u64,
}

impl WorkerReport {
    /// Every spill consumed, terminator excluded.
    pub fn spills(&self) -> u64 {
        self.data_spills + self.stats_spills + self.run_markers
    }
}

/// Whether the worker loop should keep going after a spill.
enum Flow {
    Continue,
    Terminate,
}

struct Worker {
    sink: SharedSink,
    report: WorkerReport,
}

impl Worker {
    fn fold(&mut self, spill: Spill) -> Flow {
        match spill.kind {
            SpillKind::Data => {
                self.report.data_spills += 1;
                self.report.hits += spill.hits.len() as u64;
                self.sink.add_spill(&spill);
            }
            SpillKind::StatsOnly => {
                self.report.stats_spills += 1;
                self.sink.add_spill(&spill);
            }
            SpillKind::RunStart | SpillKind::RunStop => {
                self.report.run_markers += 1;
                match (&spill.run, spill.kind) {
                    (Some(run), SpillKind::RunStart) => {
                        debug!(device = %spill.source, run = %run.id, "Run started");
                        self.sink.run_started(run);
                    }
                    (Some(run), _) => {
                        debug!(device = %spill.source, run = %run.id, events = run.total_events, "Run stopped");
                        self.sink.run_stopped(run);
                    }
                    (None, _) => trace!(device = %spill.source, "Run marker without run info"),
                }
            }
            SpillKind::Terminator => return Flow::Terminate,
        }
        Flow::Continue
    }
}

/// Worker loop. Returns once a terminator is popped, or after draining the queue when
/// `cancel` is set.
pub(crate) fn run(
    queue: SpillSender,
    sink: SharedSink,
    cancel: Arc<AtomicBool>,
    timeout: Duration,
) -> WorkerReport {
    info!("MCA worker started");
    let mut worker = Worker {
        sink,
        report: WorkerReport::default(),
    };

    loop {
        match queue.pop(timeout, &cancel) {
            Popped::Item(spill) => {
                if let Flow::Terminate = worker.fold(spill) {
                    debug!("Terminator received");
                    break;
                }
            }
            Popped::Cancelled => {
                let remaining = queue.drain();
                debug!(remaining = remaining.len(), "Cancelled; draining queue");
                for spill in remaining {
                    if let Flow::Terminate = worker.fold(spill) {
                        break;
                    }
                }
                break;
            }
            Popped::TimedOut => trace!("No spill within timeout"),
        }
    }

    info!(
        spills = worker.report.spills(),
        hits = worker.report.hits,
        "MCA worker finished"
    );
    worker.report
}
