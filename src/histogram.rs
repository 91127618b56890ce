//! Spectrum accumulation.
//!
//! The MCA worker folds every data spill into a [`HistogramSink`]. The sink is shared
//! between the worker (the only writer) and UI threads that poll [`HistogramSink::snapshot`],
//! so implementations take `&self` and lock internally.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use crate::spill::{RunInfo, Spill};

/// Sink shared between the worker and readers.
pub type SharedSink = Arc<dyn HistogramSink>;

/// Consumer of spills on the MCA worker thread.
pub trait HistogramSink: Send + Sync {
    /// Fold the hits and counters of a data or stats-only spill.
    fn add_spill(&self, spill: &Spill);

    /// A device started a run.
    fn run_started(&self, run: &RunInfo);

    /// A device finished a run.
    fn run_stopped(&self, run: &RunInfo);

    /// Copy of the current state.
    fn snapshot(&self) -> HistogramSnapshot;
}

/// Point-in-time copy of a histogram.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistogramSnapshot {
    /// Bin counts, indexed by detector channel.
    pub counts: Vec<Vec<u64>>,
    /// Hits over all channels.
    pub total_hits: u64,
    /// Spills folded in, data and stats-only.
    pub spills: u64,
    /// Runs reported by devices, in start order.
    pub runs: Vec<RunInfo>,
    /// Summed live time.
    pub live_time: Duration,
    /// Summed real time.
    pub real_time: Duration,
    /// Events the hardware reported losing.
    pub dropped: u64,
}

impl HistogramSnapshot {
    /// Counts of one channel, empty if the channel never saw a hit.
    pub fn channel(&self, channel: u16) -> &[u64] {
        self.counts
            .get(usize::from(channel))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Sum over all channels, bin by bin.
    pub fn combined(&self) -> Vec<u64> {
        let bins = self.counts.iter().map(Vec::len).max().unwrap_or(0);
        let mut sum = vec![0; bins];
        for channel in &self.counts {
            for (total, count) in sum.iter_mut().zip(channel) {
                *total += count;
            }
        }
        sum
    }
}

/// In-memory per-channel energy histogram.
#[derive(Debug)]
pub struct Histogram {
    resolution: u32,
    state: RwLock<HistogramSnapshot>,
}

impl Histogram {
    /// Histogram with `2^resolution` bins per channel (`resolution` in 1..=16).
    pub fn new(resolution: u32) -> Self {
        Self {
            resolution: resolution.clamp(1, 16),
            state: RwLock::new(HistogramSnapshot::default()),
        }
    }

    /// Wrap in an `Arc` for [`Engine::daq_start`](crate::engine::Engine::daq_start).
    pub fn shared(resolution: u32) -> Arc<Self> {
        Arc::new(Self::new(resolution))
    }

    /// Bins per channel.
    pub fn bins(&self) -> usize {
        1 << self.resolution
    }

    /// Forget all counts and runs.
    pub fn clear(&self) {
        *self.state.write() = HistogramSnapshot::default();
    }

    /// Hits over all channels.
    pub fn total_hits(&self) -> u64 {
        self.state.read().total_hits
    }

    fn bin(&self, energy: u16) -> usize {
        usize::from(energy >> (16 - self.resolution))
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new(12)
    }
}

impl HistogramSink for Histogram {
    fn add_spill(&self, spill: &Spill) {
        let bins = self.bins();
        let mut state = self.state.write();

        for hit in &spill.hits {
            let channel = usize::from(hit.channel);
            if state.counts.len() <= channel {
                state.counts.resize_with(channel + 1, Vec::new);
            }
            let counts = &mut state.counts[channel];
            if counts.is_empty() {
                counts.resize(bins, 0);
            }
            counts[self.bin(hit.energy)] += 1;
        }

        state.total_hits += spill.hits.len() as u64;
        state.spills += 1;
        state.live_time += spill.stats.live_time;
        state.real_time += spill.stats.real_time;
        state.dropped += spill.stats.dropped;
    }

    fn run_started(&self, run: &RunInfo) {
        self.state.write().runs.push(run.clone());
    }

    fn run_stopped(&self, run: &RunInfo) {
        let mut state = self.state.write();
        match state.runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => state.runs.push(run.clone()),
        }
    }

    fn snapshot(&self) -> HistogramSnapshot {
        self.state.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spill::{Hit, SpillStats};

    #[test]
    fn test_hits_land_in_bins() {
        let histogram = Histogram::new(8);
        assert_eq!(histogram.bins(), 256);

        let spill = Spill::data(
            "dev",
            0,
            vec![Hit::new(0, 1, 0x0000), Hit::new(0, 2, 0xFF00), Hit::new(3, 3, 0x0100)],
        );
        histogram.add_spill(&spill);

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.total_hits, 3);
        assert_eq!(snapshot.spills, 1);
        assert_eq!(snapshot.counts.len(), 4);
        assert_eq!(snapshot.channel(0)[0], 1);
        assert_eq!(snapshot.channel(0)[255], 1);
        assert_eq!(snapshot.channel(3)[1], 1);
        assert!(snapshot.channel(1).is_empty());
        assert!(snapshot.channel(9).is_empty());
        assert_eq!(snapshot.combined().iter().sum::<u64>(), 3);
    }

    #[test]
    fn test_stats_accumulate() {
        let histogram = Histogram::default();
        let stats = SpillStats {
            live_time: Duration::from_millis(90),
            real_time: Duration::from_millis(100),
            events: 10,
            dropped: 1,
        };
        histogram.add_spill(&Spill::stats_only("dev", 0, stats));
        histogram.add_spill(&Spill::stats_only("dev", 1, stats));

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.total_hits, 0);
        assert_eq!(snapshot.live_time, Duration::from_millis(180));
        assert_eq!(snapshot.real_time, Duration::from_millis(200));
        assert_eq!(snapshot.dropped, 2);

        histogram.clear();
        assert_eq!(histogram.snapshot().spills, 0);
    }

    #[test]
    fn test_run_bookkeeping() {
        let histogram = Histogram::default();
        let mut run = RunInfo::begin("dev");
        histogram.run_started(&run);
        assert!(histogram.snapshot().runs[0].stopped.is_none());

        run.finish(42);
        histogram.run_stopped(&run);
        let runs = histogram.snapshot().runs;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].total_events, 42);
        assert!(runs[0].stopped.is_some());
    }
}
