//! Mock Acquisition Source
//!
//! Deterministic, programmable device for testing the engine without hardware.
//!
//! - Boot can be made to fail (`failing_boot`), to exercise partial-boot handling.
//! - The producer emits a fixed number of spills (`with_spill_count`) at a steady rate,
//!   each with `hits_per_spill` hits, so tests can assert exact totals.
//! - The producer can be made to panic after N spills (`panicking_after`), to exercise
//!   fault isolation.
//!
//! # Example
//!
//! ```rust
//! use mca_daq::hardware::mock::MockSource;
//! use mca_daq::source::Source;
//!
//! let mut source = MockSource::new("mock0").with_spill_count(10).with_hits_per_spill(4);
//! assert!(source.boot());
//! assert!(source.status().is_ready());
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{AppResult, DaqError};
use crate::hardware::producer::Producer;
use crate::setting::{SettingMeta, SettingNode, SettingStore, SettingType, SettingValue};
use crate::source::{Source, SpillSender};
use crate::spill::{Hit, RunInfo, Spill, SpillStats};
use crate::status::{Capability, StatusFlags};

/// Registry configuration for `type = "mock"` devices.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Boot always fails.
    pub boot_fails: bool,
    /// Stop producing after this many data spills.
    pub spill_count: Option<u64>,
    /// Hits in each data spill.
    pub hits_per_spill: usize,
    /// Delay between spills.
    pub interval_ms: u64,
    /// Advertise `CAN_OSCILLOSCOPE` once booted.
    pub oscilloscope: bool,
    /// Number of detector channels hits are spread over.
    pub channels: u16,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            boot_fails: false,
            spill_count: None,
            hits_per_spill: 16,
            interval_ms: 5,
            oscilloscope: false,
            channels: 2,
        }
    }
}

/// Programmable mock device.
pub struct MockSource {
    name: String,
    status: StatusFlags,
    settings: SettingStore,
    config: MockConfig,
    panic_after: Option<u64>,
    producer: Producer,
    produced: Arc<AtomicU64>,
    boot_attempts: u32,
}

impl MockSource {
    /// Loaded, bootable mock with default behaviour.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(name, MockConfig::default())
    }

    /// Mock built from registry configuration.
    pub fn from_config(name: impl Into<String>, config: MockConfig) -> Self {
        let name = name.into();
        let mut settings = SettingStore::new();
        settings.define(
            SettingMeta::new(format!("{name}/Gain"), SettingType::Floating)
                .with_bounds(0.0, 100.0)
                .with_step(0.1),
        );
        settings.define(
            SettingMeta::new(format!("{name}/Threshold"), SettingType::Integer)
                .with_bounds(0.0, 4095.0),
        );
        settings.define(SettingMeta::new(format!("{name}/Label"), SettingType::Text));
        settings.define(SettingMeta::new(format!("{name}/ClearCounters"), SettingType::Command));
        settings.define(SettingMeta::new(
            format!("{name}/SpillsProduced"),
            SettingType::Indicator,
        ));

        Self {
            name,
            status: StatusFlags::loaded(),
            settings,
            config,
            panic_after: None,
            producer: Producer::default(),
            produced: Arc::new(AtomicU64::new(0)),
            boot_attempts: 0,
        }
    }

    /// Every boot attempt fails.
    pub fn failing_boot(mut self) -> Self {
        self.config.boot_fails = true;
        self
    }

    /// Produce exactly `count` data spills per run.
    pub fn with_spill_count(mut self, count: u64) -> Self {
        self.config.spill_count = Some(count);
        self
    }

    /// Hits in each data spill.
    pub fn with_hits_per_spill(mut self, hits: usize) -> Self {
        self.config.hits_per_spill = hits;
        self
    }

    /// Delay between spills.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.config.interval_ms = interval.as_millis() as u64;
        self
    }

    /// Advertise oscilloscope support once booted.
    pub fn with_oscilloscope(mut self) -> Self {
        self.config.oscilloscope = true;
        self
    }

    /// Producer panics after pushing `spills` data spills.
    pub fn panicking_after(mut self, spills: u64) -> Self {
        self.panic_after = Some(spills);
        self
    }

    /// Number of times `boot()` has been called.
    pub fn boot_attempts(&self) -> u32 {
        self.boot_attempts
    }

    /// Current value of a setting.
    pub fn setting(&self, id: &str) -> Option<&SettingValue> {
        self.settings.get(id)
    }

    fn settings_snapshot(&self) -> SettingNode {
        let mut node = SettingNode::stem(self.name.clone());
        self.settings.fill(&mut node);
        node
    }
}

impl Source for MockSource {
    fn plugin_name(&self) -> &'static str {
        "mock"
    }

    fn device_name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> StatusFlags {
        if self.producer.faulted() {
            self.status.without_capability(Capability::Run)
        } else {
            self.status
        }
    }

    fn setting_definitions(&self) -> &BTreeMap<String, SettingMeta> {
        self.settings.definitions()
    }

    fn boot(&mut self) -> bool {
        self.boot_attempts += 1;
        debug!(device = %self.name, attempt = self.boot_attempts, "Attempting to boot");

        if self.status.is_booted() {
            return true;
        }
        // a dead instance is reloaded before booting; on failure it stays dead
        let current = if self.status.is_dead() {
            StatusFlags::loaded()
        } else {
            self.status
        };
        if !current.can(Capability::Boot) {
            warn!(device = %self.name, "Cannot boot. Failed flag check (can_boot == 0)");
            return false;
        }
        if self.config.boot_fails {
            warn!(device = %self.name, "Boot failed: controller did not respond");
            return false;
        }

        self.producer.clear_fault();
        let mut status = StatusFlags::booted();
        if self.config.oscilloscope {
            status = status.with_capability(Capability::Oscilloscope);
        }
        self.status = status;
        info!(device = %self.name, status = %self.status, "Booted");
        true
    }

    fn die(&mut self) -> bool {
        self.producer.stop(&self.name);
        self.status = StatusFlags::DEAD;
        debug!(device = %self.name, "Disconnected");
        true
    }

    #[allow(clippy::panic)]
    fn daq_start(&mut self, queue: SpillSender) -> bool {
        if !self.status().is_ready() {
            warn!(device = %self.name, status = %self.status(), "Refusing to start: not ready");
            return false;
        }

        let name = self.name.clone();
        let config = self.config.clone();
        let panic_after = self.panic_after;
        let run = RunInfo::begin(&name).with_settings(self.settings_snapshot());
        let interval = Duration::from_millis(config.interval_ms);
        let produced = Arc::clone(&self.produced);

        self.producer.start(&self.name, queue, move |stop, queue| {
            let mut run = run;
            queue.push(Spill::run_start(&name, run.clone()));

            let mut sequence = 0u64;
            let mut events = 0u64;
            while !stop.load(Ordering::SeqCst) {
                if config.spill_count.is_some_and(|limit| sequence >= limit) {
                    break;
                }
                if panic_after.is_some_and(|limit| sequence >= limit) {
                    panic!("simulated producer fault after {sequence} spills");
                }

                let hits: Vec<Hit> = (0..config.hits_per_spill)
                    .map(|i| {
                        let n = sequence * config.hits_per_spill as u64 + i as u64;
                        Hit::new(
                            (i as u16) % config.channels.max(1),
                            n * 10,
                            (n % 4096) as u16 * 16,
                        )
                    })
                    .collect();
                events += hits.len() as u64;

                let stats = SpillStats {
                    live_time: interval,
                    real_time: interval,
                    events: hits.len() as u64,
                    dropped: 0,
                };
                queue.push(Spill::data(&name, sequence, hits).with_stats(stats));
                produced.fetch_add(1, Ordering::Relaxed);
                sequence += 1;

                if !interval.is_zero() {
                    thread::sleep(interval);
                }
            }

            run.finish(events);
            queue.push(Spill::run_stop(&name, sequence, run));
        })
    }

    fn daq_stop(&mut self) -> bool {
        self.producer.stop(&self.name);
        true
    }

    fn daq_running(&self) -> bool {
        self.producer.is_running()
    }

    fn read_settings_bulk(&self, set: &mut SettingNode) -> bool {
        if set.id != self.name {
            return false;
        }
        self.settings.fill(set);
        if let Some(node) = set.branch_mut(&format!("{}/SpillsProduced", self.name)) {
            node.value = SettingValue::Float(self.produced.load(Ordering::Relaxed) as f64);
        }
        true
    }

    fn write_settings_bulk(&mut self, set: &SettingNode) -> AppResult<()> {
        self.settings.apply(&self.name, set)
    }

    fn execute_command(&mut self, set: &mut SettingNode) -> bool {
        if set.id != self.name {
            return false;
        }
        let mut executed = false;
        for branch in &mut set.branches {
            if branch.metadata.setting_type == SettingType::Command
                && branch.value.as_i64() == Some(1)
            {
                branch.value = SettingValue::Int(0);
                if branch.id == format!("{}/ClearCounters", self.name) {
                    self.produced.store(0, Ordering::Relaxed);
                    executed = true;
                }
            }
        }
        executed
    }

    fn oscilloscope(&mut self) -> AppResult<Vec<Hit>> {
        if !self.status().can(Capability::Oscilloscope) {
            return Err(DaqError::Unsupported(format!(
                "{} has no oscilloscope",
                self.name
            )));
        }
        Ok((0..self.config.channels)
            .map(|channel| {
                let trace = (0..64u16).map(|t| if t < 16 { 0 } else { 1000 - t }).collect();
                Hit::new(channel, 0, 1000).with_trace(trace)
            })
            .collect())
    }
}

impl Drop for MockSource {
    fn drop(&mut self) {
        self.die();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SpillQueue;
    use crate::spill::SpillKind;

    #[test]
    fn test_failed_boot_leaves_status() {
        let mut source = MockSource::new("m").failing_boot();
        assert!(!source.boot());
        assert_eq!(source.status(), StatusFlags::loaded());
        assert!(!source.boot());
        assert_eq!(source.boot_attempts(), 2);
    }

    #[test]
    fn test_failed_reboot_stays_dead() {
        let mut source = MockSource::new("m").failing_boot();
        assert!(source.die());
        assert!(!source.boot());
        assert_eq!(source.status(), StatusFlags::DEAD);
    }

    #[test]
    fn test_start_requires_boot() {
        let mut source = MockSource::new("m");
        let queue = Arc::new(SpillQueue::new());
        assert!(!source.daq_start(Arc::clone(&queue)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_produces_exact_count() {
        let mut source = MockSource::new("m")
            .with_spill_count(5)
            .with_hits_per_spill(3)
            .with_interval(Duration::ZERO);
        assert!(source.boot());

        let queue = Arc::new(SpillQueue::new());
        assert!(source.daq_start(Arc::clone(&queue)));
        while source.daq_running() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(source.daq_stop());

        let spills = queue.drain();
        let kinds: Vec<SpillKind> = spills.iter().map(|s| s.kind).collect();
        assert_eq!(kinds.first(), Some(&SpillKind::RunStart));
        assert_eq!(kinds.last(), Some(&SpillKind::RunStop));
        let hits: usize = spills.iter().map(|s| s.hits.len()).sum();
        assert_eq!(hits, 15);
    }

    #[test]
    fn test_die_is_idempotent() {
        let mut source = MockSource::new("m");
        assert!(source.boot());
        assert!(source.die());
        assert!(source.die());
        assert_eq!(source.status(), StatusFlags::DEAD);
        assert!(source.boot());
        assert!(source.status().is_ready());
    }

    #[test]
    fn test_oscilloscope_is_capability_checked() {
        let mut plain = MockSource::new("m");
        plain.boot();
        assert!(matches!(plain.oscilloscope(), Err(DaqError::Unsupported(_))));

        let mut scope = MockSource::new("s").with_oscilloscope();
        scope.boot();
        assert_eq!(scope.oscilloscope().map(|h| h.len()).ok(), Some(2));
    }

    #[test]
    fn test_execute_clear_counters() {
        let mut source = MockSource::new("m");
        let mut set = SettingNode::stem("m");
        assert!(source.read_settings_bulk(&mut set));
        if let Some(node) = set.find_mut("m/ClearCounters") {
            node.value = SettingValue::Int(1);
        }
        assert!(source.execute_command(&mut set));
        assert_eq!(
            set.find("m/ClearCounters").map(|n| n.value.clone()),
            Some(SettingValue::Int(0))
        );
    }
}
