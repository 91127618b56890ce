//! Spills: the unit of transfer from a device to the histogram builder.
//!
//! A [`Spill`] is a plain value. The producing device thread builds it, moves it into
//! the [`SpillQueue`](crate::queue::SpillQueue), and from there it is moved into the MCA
//! worker, which drops it once it has been folded into the histogram sink. Nothing in the
//! pipeline shares a spill; every hand-off is a move.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::setting::SettingNode;

/// One raw detector event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hit {
    /// Detector channel index.
    pub channel: u16,
    /// Hardware timestamp in device clock ticks.
    pub timestamp: u64,
    /// ADC value (full 16-bit scale).
    pub energy: u16,
    /// Raw waveform, only filled in for oscilloscope previews.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<u16>,
}

impl Hit {
    /// Event without a waveform.
    pub fn new(channel: u16, timestamp: u64, energy: u16) -> Self {
        Self {
            channel,
            timestamp,
            energy,
            trace: Vec::new(),
        }
    }

    /// Attach a preview waveform.
    pub fn with_trace(mut self, trace: Vec<u16>) -> Self {
        self.trace = trace;
        self
    }
}

/// Metadata for one acquisition run on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    /// Unique run identifier.
    pub id: Uuid,
    /// Device that produced the run.
    pub source: String,
    /// Wall-clock start.
    pub started: DateTime<Utc>,
    /// Wall-clock stop, once the run has ended.
    pub stopped: Option<DateTime<Utc>>,
    /// Events produced over the whole run.
    pub total_events: u64,
    /// Device settings at run start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingNode>,
}

impl RunInfo {
    /// Start a new run now.
    pub fn begin(source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            started: Utc::now(),
            stopped: None,
            total_events: 0,
            settings: None,
        }
    }

    /// Attach a settings snapshot.
    pub fn with_settings(mut self, settings: SettingNode) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Mark the run as finished.
    pub fn finish(&mut self, total_events: u64) {
        self.stopped = Some(Utc::now());
        self.total_events = total_events;
    }

    /// Wall-clock duration, if finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.stopped.map(|stopped| stopped - self.started)
    }
}

/// What a spill carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpillKind {
    /// Hits (and stats) from the device.
    Data,
    /// Counters only, no hits.
    StatsOnly,
    /// First spill of a device run; `run` is set.
    RunStart,
    /// Last spill of a device run; `run` is set and finished.
    RunStop,
    /// Pushed by the engine to end the worker loop.
    Terminator,
}

/// Counters reported alongside each spill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpillStats {
    /// Time the hardware was able to accept events.
    pub live_time: Duration,
    /// Wall-clock time covered.
    pub real_time: Duration,
    /// Events the hardware saw, including dropped ones.
    pub events: u64,
    /// Events lost before read-out.
    pub dropped: u64,
}

/// One batch of acquired data plus metadata.
#[derive(Debug, Clone)]
pub struct Spill {
    /// Producing device (empty for the engine terminator).
    pub source: String,
    /// Per-device, per-run sequence number.
    pub sequence: u64,
    /// Kind marker.
    pub kind: SpillKind,
    /// Wall-clock creation time.
    pub time: DateTime<Utc>,
    /// Device clock at read-out.
    pub hw_ticks: u64,
    /// Raw hits.
    pub hits: Vec<Hit>,
    /// Counters.
    pub stats: SpillStats,
    /// Run metadata for `RunStart`/`RunStop` spills.
    pub run: Option<RunInfo>,
    /// Optional settings snapshot.
    pub settings: Option<SettingNode>,
}

impl Spill {
    fn empty(source: &str, sequence: u64, kind: SpillKind) -> Self {
        Self {
            source: source.to_string(),
            sequence,
            kind,
            time: Utc::now(),
            hw_ticks: 0,
            hits: Vec::new(),
            stats: SpillStats::default(),
            run: None,
            settings: None,
        }
    }

    /// Data spill carrying hits.
    pub fn data(source: &str, sequence: u64, hits: Vec<Hit>) -> Self {
        let mut spill = Self::empty(source, sequence, SpillKind::Data);
        spill.hw_ticks = hits.last().map(|hit| hit.timestamp).unwrap_or_default();
        spill.stats.events = hits.len() as u64;
        spill.hits = hits;
        spill
    }

    /// Counters-only spill.
    pub fn stats_only(source: &str, sequence: u64, stats: SpillStats) -> Self {
        let mut spill = Self::empty(source, sequence, SpillKind::StatsOnly);
        spill.stats = stats;
        spill
    }

    /// Run-start marker.
    pub fn run_start(source: &str, run: RunInfo) -> Self {
        let mut spill = Self::empty(source, 0, SpillKind::RunStart);
        spill.settings = run.settings.clone();
        spill.run = Some(run);
        spill
    }

    /// Run-stop marker.
    pub fn run_stop(source: &str, sequence: u64, run: RunInfo) -> Self {
        let mut spill = Self::empty(source, sequence, SpillKind::RunStop);
        spill.run = Some(run);
        spill
    }

    /// Engine-issued end-of-stream marker.
    pub fn terminator() -> Self {
        Self::empty("", u64::MAX, SpillKind::Terminator)
    }

    /// Replace the counters.
    pub fn with_stats(mut self, stats: SpillStats) -> Self {
        self.stats = stats;
        self
    }

    /// Whether this spill ends the worker loop.
    pub fn is_terminator(&self) -> bool {
        self.kind == SpillKind::Terminator
    }
}
