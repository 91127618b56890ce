//! Simulated multi-channel analyzer.
//!
//! Produces a single Gaussian peak on a flat background, spread over four detector
//! channels, at a configurable count rate. Useful for demos and soak runs where the
//! exact contents of each spill do not matter.
//!
//! Settings (all ids are prefixed with the device name):
//!
//! | Id | Type | Meaning |
//! |----|------|---------|
//! | `CountRate` | floating, cps | mean hits per second over all channels |
//! | `SpillInterval` | integer, ms | read-out period |
//! | `Resolution` | integer, bits | ADC resolution the energies are quantized to |
//! | `PeakCenter` | floating | peak position as a fraction of full scale |
//! | `PeakWidth` | floating | peak sigma as a fraction of full scale |
//! | `Channel{i}/Detector` | detector | name of the detector on channel i |
//! | `Channel{i}/Gain` | floating | energy scale of channel i |
//! | `DeadTime` | indicator, % | dead time of the last run |

use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Deserialize;
use tracing::{debug, info, trace, warn};

use crate::error::{AppResult, DaqError};
use crate::hardware::producer::Producer;
use crate::setting::{SettingMeta, SettingNode, SettingStore, SettingType, SettingValue};
use crate::source::{Source, SpillSender};
use crate::spill::{Hit, RunInfo, Spill, SpillStats};
use crate::status::{Capability, StatusFlags};

/// Detector channels of the simulated analyzer.
pub const CHANNELS: u16 = 4;

const TICKS_PER_SECOND: f64 = 100e6;
const BACKGROUND_FRACTION: f64 = 0.3;
const TRACE_LENGTH: usize = 256;

/// Registry configuration for `type = "simulator"` devices.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Mean hits per second.
    pub count_rate: f64,
    /// Read-out period.
    pub spill_interval_ms: i64,
    /// ADC bits.
    pub resolution: i64,
    /// Peak position, fraction of full scale.
    pub peak_center: f64,
    /// Peak sigma, fraction of full scale.
    pub peak_width: f64,
    /// JSON settings subtree applied on boot.
    pub profile: Option<PathBuf>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            count_rate: 1000.0,
            spill_interval_ms: 100,
            resolution: 13,
            peak_center: 0.5,
            peak_width: 0.02,
            profile: None,
        }
    }
}

/// Parameters frozen at run start.
#[derive(Debug, Clone, Copy)]
struct Shape {
    count_rate: f64,
    interval: Duration,
    resolution: u32,
    center: f64,
    width: f64,
    gains: [f64; CHANNELS as usize],
}

impl Shape {
    fn quantize(&self, fraction: f64) -> u16 {
        let full = f64::from(u16::MAX);
        let raw = (fraction.clamp(0.0, 1.0) * full) as u16;
        raw & (u16::MAX << (16 - self.resolution.clamp(1, 16)))
    }

    fn sample_energy<R: Rng>(&self, rng: &mut R, channel: u16) -> u16 {
        let gain = self.gains.get(usize::from(channel)).copied().unwrap_or(1.0);
        if rng.gen_bool(BACKGROUND_FRACTION) {
            return self.quantize(rng.gen::<f64>() * gain);
        }
        // Box-Muller
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos();
        self.quantize((self.center + z * self.width) * gain)
    }
}

/// Simulated MCA backend.
pub struct Simulator {
    name: String,
    status: StatusFlags,
    settings: SettingStore,
    profile: Option<PathBuf>,
    producer: Producer,
    dropped: Arc<AtomicU64>,
    events: Arc<AtomicU64>,
}

impl Simulator {
    /// Simulator with default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(name, SimulatorConfig::default())
    }

    /// Simulator built from registry configuration.
    pub fn from_config(name: impl Into<String>, config: SimulatorConfig) -> Self {
        let name = name.into();
        let mut settings = SettingStore::new();

        let values = [
            (
                SettingMeta::new(format!("{name}/CountRate"), SettingType::Floating)
                    .with_bounds(1.0, 1e6)
                    .with_unit("cps"),
                SettingValue::Float(config.count_rate),
            ),
            (
                SettingMeta::new(format!("{name}/SpillInterval"), SettingType::Integer)
                    .with_bounds(1.0, 10_000.0)
                    .with_unit("ms"),
                SettingValue::Int(config.spill_interval_ms),
            ),
            (
                SettingMeta::new(format!("{name}/Resolution"), SettingType::Integer)
                    .with_bounds(8.0, 16.0)
                    .with_unit("bits"),
                SettingValue::Int(config.resolution),
            ),
            (
                SettingMeta::new(format!("{name}/PeakCenter"), SettingType::Floating)
                    .with_bounds(0.0, 1.0)
                    .with_step(0.001),
                SettingValue::Float(config.peak_center),
            ),
            (
                SettingMeta::new(format!("{name}/PeakWidth"), SettingType::Floating)
                    .with_bounds(0.0, 0.5)
                    .with_step(0.001),
                SettingValue::Float(config.peak_width),
            ),
            (
                SettingMeta::new(format!("{name}/DeadTime"), SettingType::Indicator)
                    .with_unit("%"),
                SettingValue::Float(0.0),
            ),
        ];
        for (meta, value) in values {
            let id = meta.id.clone();
            settings.define(meta);
            settings.set_internal(&id, value);
        }
        for channel in 0..CHANNELS {
            settings.define(
                SettingMeta::new(format!("{name}/Channel{channel}/Detector"), SettingType::Detector)
                    .with_index(channel),
            );
            let gain = format!("{name}/Channel{channel}/Gain");
            settings.define(
                SettingMeta::new(gain.clone(), SettingType::Floating)
                    .with_bounds(0.5, 2.0)
                    .with_step(0.001)
                    .with_index(channel),
            );
            settings.set_internal(&gain, SettingValue::Float(1.0));
        }

        Self {
            name,
            status: StatusFlags::loaded(),
            settings,
            profile: config.profile,
            producer: Producer::default(),
            dropped: Arc::new(AtomicU64::new(0)),
            events: Arc::new(AtomicU64::new(0)),
        }
    }

    fn shape(&self) -> Shape {
        let float = |key: &str, default: f64| {
            self.settings
                .get(&format!("{}/{key}", self.name))
                .and_then(SettingValue::as_f64)
                .unwrap_or(default)
        };
        Shape {
            count_rate: float("CountRate", 1000.0),
            interval: Duration::from_millis(float("SpillInterval", 100.0).max(1.0) as u64),
            resolution: float("Resolution", 13.0) as u32,
            center: float("PeakCenter", 0.5),
            width: float("PeakWidth", 0.02),
            gains: std::array::from_fn(|channel| float(&format!("Channel{channel}/Gain"), 1.0)),
        }
    }

    fn apply_profile(&mut self, path: &Path) -> AppResult<()> {
        let profile = SettingNode::load_json(path)?;
        self.settings.apply(&self.name, &profile)
    }

    fn snapshot(&self) -> SettingNode {
        let mut node = SettingNode::stem(self.name.clone());
        self.read_settings_bulk(&mut node);
        node
    }
}

impl Source for Simulator {
    fn plugin_name(&self) -> &'static str {
        "simulator"
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

    fn profile_path(&self) -> Option<&Path> {
        self.profile.as_deref()
    }

    fn setting_definitions(&self) -> &BTreeMap<String, SettingMeta> {
        self.settings.definitions()
    }

    fn boot(&mut self) -> bool {
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

        if let Some(path) = self.profile.clone() {
            if let Err(e) = self.apply_profile(&path) {
                warn!(device = %self.name, profile = %path.display(), error = %e, "Boot failed: profile not applied");
                return false;
            }
            debug!(device = %self.name, profile = %path.display(), "Applied boot profile");
        }

        self.producer.clear_fault();
        self.status = StatusFlags::booted().with_capability(Capability::Oscilloscope);
        info!(device = %self.name, status = %self.status, "Booted");
        true
    }

    fn die(&mut self) -> bool {
        self.producer.stop(&self.name);
        self.status = StatusFlags::DEAD;
        debug!(device = %self.name, "Disconnected");
        true
    }

    fn daq_start(&mut self, queue: SpillSender) -> bool {
        if !self.status().is_ready() {
            warn!(device = %self.name, status = %self.status(), "Refusing to start: not ready");
            return false;
        }

        let name = self.name.clone();
        let shape = self.shape();
        let run = RunInfo::begin(&name).with_settings(self.snapshot());
        let dropped = Arc::clone(&self.dropped);
        let events = Arc::clone(&self.events);
        dropped.store(0, Ordering::Relaxed);
        events.store(0, Ordering::Relaxed);

        info!(device = %name, rate = shape.count_rate, interval = ?shape.interval, "Starting simulated run");

        self.producer.start(&self.name, queue, move |stop, queue| {
            let mut rng = rand::thread_rng();
            let mut run = run;
            queue.push(Spill::run_start(&name, run.clone()));

            let started = Instant::now();
            let mut ticks = 0u64;
            let mut sequence = 0u64;
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(shape.interval);

                let expected = shape.count_rate * shape.interval.as_secs_f64();
                let count = (expected * rng.gen_range(0.9..1.1)).round() as u64;
                let lost = (count as f64 * rng.gen_range(0.0..0.02)).round() as u64;

                let span = (shape.interval.as_secs_f64() * TICKS_PER_SECOND) as u64;
                let hits: Vec<Hit> = (0..count - lost)
                    .map(|_| {
                        let channel = rng.gen_range(0..CHANNELS);
                        Hit::new(
                            channel,
                            ticks + rng.gen_range(0..span.max(1)),
                            shape.sample_energy(&mut rng, channel),
                        )
                    })
                    .collect();
                ticks += span;

                events.fetch_add(count, Ordering::Relaxed);
                dropped.fetch_add(lost, Ordering::Relaxed);
                let live = shape.interval.mul_f64(1.0 - lost as f64 / count.max(1) as f64);
                let stats = SpillStats {
                    live_time: live,
                    real_time: shape.interval,
                    events: count,
                    dropped: lost,
                };

                trace!(device = %name, sequence, hits = hits.len(), "Spill");
                let mut spill = Spill::data(&name, sequence, hits).with_stats(stats);
                spill.hw_ticks = ticks;
                queue.push(spill);
                sequence += 1;
            }

            run.finish(events.load(Ordering::Relaxed));
            debug!(device = %name, elapsed = ?started.elapsed(), spills = sequence, "Simulated run finished");
            queue.push(Spill::run_stop(&name, sequence, run));
        })
    }

    fn daq_stop(&mut self) -> bool {
        self.producer.stop(&self.name);
        let events = self.events.load(Ordering::Relaxed);
        if events > 0 {
            let percent = 100.0 * self.dropped.load(Ordering::Relaxed) as f64 / events as f64;
            self.settings
                .set_internal(&format!("{}/DeadTime", self.name), SettingValue::Float(percent));
        }
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
        true
    }

    fn write_settings_bulk(&mut self, set: &SettingNode) -> AppResult<()> {
        if self.producer.is_running() {
            debug!(device = %self.name, "Settings written during a run apply from the next run");
        }
        self.settings.apply(&self.name, set)
    }

    fn execute_command(&mut self, _set: &mut SettingNode) -> bool {
        // no command-type settings
        false
    }

    fn oscilloscope(&mut self) -> AppResult<Vec<Hit>> {
        if !self.status().can(Capability::Oscilloscope) {
            return Err(DaqError::Unsupported(format!(
                "{} has no oscilloscope",
                self.name
            )));
        }

        let shape = self.shape();
        let mut rng = rand::thread_rng();
        Ok((0..CHANNELS)
            .map(|channel| {
                let energy = shape.sample_energy(&mut rng, channel);
                let amplitude = f64::from(energy) / 16.0;
                let trace = (0..TRACE_LENGTH)
                    .map(|t| {
                        let baseline = 100.0 + rng.gen_range(-3.0..3.0);
                        let pulse = if t < 32 {
                            0.0
                        } else {
                            amplitude * (-((t - 32) as f64) / 40.0).exp()
                        };
                        (baseline + pulse).clamp(0.0, f64::from(u16::MAX)) as u16
                    })
                    .collect();
                Hit::new(channel, 0, energy).with_trace(trace)
            })
            .collect())
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.die();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SpillQueue;

    #[test]
    fn test_quantize_respects_resolution() {
        let shape = Shape {
            count_rate: 1.0,
            interval: Duration::from_millis(1),
            resolution: 8,
            center: 0.5,
            width: 0.0,
            gains: [1.0; CHANNELS as usize],
        };
        assert_eq!(shape.quantize(1.0) & 0x00FF, 0);
        assert_eq!(shape.quantize(-1.0), 0);
    }

    #[test]
    fn test_streams_hits() {
        let mut sim = Simulator::from_config(
            "sim",
            SimulatorConfig {
                count_rate: 10_000.0,
                spill_interval_ms: 5,
                ..Default::default()
            },
        );
        assert!(sim.boot());
        assert!(sim.status().can(Capability::Oscilloscope));

        let queue = Arc::new(SpillQueue::new());
        assert!(sim.daq_start(Arc::clone(&queue)));
        thread::sleep(Duration::from_millis(50));
        assert!(sim.daq_stop());
        assert!(!sim.daq_running());

        let hits: usize = queue.drain().iter().map(|s| s.hits.len()).sum();
        assert!(hits > 0);
    }

    #[test]
    fn test_bad_profile_fails_boot_without_status_change() {
        let sim_config = SimulatorConfig {
            profile: Some(PathBuf::from("/nonexistent/profile.json")),
            ..Default::default()
        };
        let mut sim = Simulator::from_config("sim", sim_config);
        assert!(!sim.boot());
        assert_eq!(sim.status(), StatusFlags::loaded());
    }

    #[test]
    fn test_profile_applied_on_boot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.json");
        SettingNode::stem("sim")
            .with_branch(SettingNode::stem("sim/CountRate").with_value(SettingValue::Float(42.0)))
            .save_json(&path)
            .unwrap();

        let mut sim = Simulator::from_config(
            "sim",
            SimulatorConfig {
                profile: Some(path),
                ..Default::default()
            },
        );
        assert!(sim.boot());
        assert_eq!(sim.shape().count_rate, 42.0);
    }

    #[test]
    fn test_die_leaves_instance_dead_but_bootable() {
        let mut sim = Simulator::new("sim");
        assert!(sim.boot());
        assert!(sim.die());
        assert_eq!(sim.status(), StatusFlags::DEAD);
        assert!(sim.boot());
        assert!(sim.status().is_ready());
    }

    #[test]
    fn test_channel_gain_scales_energy() {
        let mut shape = Shape {
            count_rate: 1.0,
            interval: Duration::from_millis(1),
            resolution: 16,
            center: 0.4,
            width: 0.0,
            gains: [1.0; CHANNELS as usize],
        };
        shape.gains[2] = 2.0;
        let mut rng = rand::thread_rng();
        let peak = |rng: &mut rand::rngs::ThreadRng, channel| {
            // the background is uniform, the peak is a single bin with zero width
            (0..200)
                .map(|_| shape.sample_energy(rng, channel))
                .filter(|&e| e == shape.quantize(0.4 * shape.gains[usize::from(channel)]))
                .count()
        };
        assert!(peak(&mut rng, 0) > 50);
        assert!(peak(&mut rng, 2) > 50);
        assert_ne!(shape.quantize(0.4), shape.quantize(0.8));
    }

    #[test]
    fn test_oscilloscope_traces() {
        let mut sim = Simulator::new("sim");
        assert!(sim.oscilloscope().is_err());
        sim.boot();
        let traces = sim.oscilloscope().unwrap();
        assert_eq!(traces.len(), CHANNELS as usize);
        assert!(traces.iter().all(|h| h.trace.len() == TRACE_LENGTH));
    }
}
