//! Acquisition engine.
//!
//! The [`Engine`] owns every device, keeps their aggregate status and a merged settings
//! tree, and runs acquisitions: devices stream spills into one shared queue from their
//! own threads while a single MCA worker folds them into a histogram sink.
//!
//! # Locking
//!
//! - `state` guards the device list, aggregate status, settings tree and detectors.
//!   It is held only for short bookkeeping and never across a device call.
//! - Each device sits behind its own mutex. Device calls that block (boot, joins)
//!   hold only that lock. When both are needed the device lock is taken first.
//! - `control` serializes start, stop and die so two callers cannot interleave an
//!   acquisition lifecycle.

mod settings;
pub mod worker;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::detector::Detector;
use crate::error::{AppResult, DaqError};
use crate::hardware::registry::SourceRegistry;
use crate::histogram::SharedSink;
use crate::queue::{SpillQueue, DEFAULT_POLL_INTERVAL};
use crate::setting::SettingNode;
use crate::source::{Source, SpillSender};
use crate::spill::{Hit, RunInfo, Spill, SpillKind};
use crate::status::{Capability, StatusFlags};

pub use worker::WorkerReport;

/// Id of the root of the engine settings tree.
pub const SETTINGS_ROOT: &str = "Engine";

type DeviceHandle = Arc<Mutex<Box<dyn Source>>>;

struct EngineState {
    /// Insertion order is boot and push order.
    devices: Vec<(String, DeviceHandle)>,
    aggregate: StatusFlags,
    settings: SettingNode,
    detectors: Vec<Detector>,
    profile_path: Option<PathBuf>,
    settings_path: Option<PathBuf>,
}

impl EngineState {
    fn handle(&self, name: &str) -> Option<DeviceHandle> {
        self.devices
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, handle)| Arc::clone(handle))
    }
}

/// A running acquisition.
struct Acquisition {
    queue: SpillSender,
    worker: JoinHandle<WorkerReport>,
    started: Vec<(String, DeviceHandle)>,
}

/// Hits collected by a list-mode run.
#[derive(Debug, Clone)]
pub struct ListData {
    /// Engine-level run covering every device, finished with the hit count.
    pub run: RunInfo,
    /// Every hit, in the order the devices produced them.
    pub hits: Vec<Hit>,
}

/// Device orchestrator.
pub struct Engine {
    state: Mutex<EngineState>,
    control: Mutex<()>,
    acquisition: Mutex<Option<Acquisition>>,
    cancel: Arc<AtomicBool>,
    last_report: Mutex<Option<WorkerReport>>,
    poll_interval: Duration,
    worker_timeout: Duration,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Engine with no devices and default timing.
    pub fn new() -> Self {
        Self::with_timing(DEFAULT_POLL_INTERVAL, DEFAULT_POLL_INTERVAL)
    }

    /// Engine whose queues wake at least every `poll_interval` and whose worker waits at
    /// most `worker_timeout` per pop.
    pub fn with_timing(poll_interval: Duration, worker_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(EngineState {
                devices: Vec::new(),
                aggregate: StatusFlags::DEAD,
                settings: SettingNode::stem(SETTINGS_ROOT),
                detectors: Vec::new(),
                profile_path: None,
                settings_path: None,
            }),
            control: Mutex::new(()),
            acquisition: Mutex::new(None),
            cancel: Arc::new(AtomicBool::new(false)),
            last_report: Mutex::new(None),
            poll_interval,
            worker_timeout,
        }
    }

    /// Build an engine and its enabled devices from configuration.
    pub fn from_config(config: &EngineConfig, registry: &SourceRegistry) -> AppResult<Self> {
        config.validate()?;
        let engine = Self::with_timing(
            config.acquisition.poll_interval(),
            config.acquisition.worker_timeout(),
        );
        for definition in config.enabled_devices() {
            let source = registry.create(&definition.r#type, &definition.id, &definition.config)?;
            engine.add_device(&definition.id, source)?;
        }
        info!(
            application = %config.application.name,
            devices = engine.device_names().len(),
            "Engine configured"
        );
        Ok(engine)
    }

    // ---------------------------------------------------------------------------------
    // Devices
    // ---------------------------------------------------------------------------------

    /// Take ownership of a device. `name` must equal the device's own name.
    pub fn add_device(&self, name: &str, source: Box<dyn Source>) -> AppResult<()> {
        if source.device_name() != name {
            return Err(DaqError::WrongDevice {
                expected: name.to_string(),
                found: source.device_name().to_string(),
            });
        }
        let plugin = source.plugin_name();
        {
            let mut state = self.state.lock();
            if state.handle(name).is_some() {
                return Err(DaqError::Configuration(format!(
                    "Device '{name}' is already registered"
                )));
            }
            state
                .devices
                .push((name.to_string(), Arc::new(Mutex::new(source))));
        }
        info!(device = name, plugin, "Device added");

        self.refresh_status();
        self.pull_settings();
        Ok(())
    }

    /// Shut a device down and drop it.
    pub fn remove_device(&self, name: &str) -> AppResult<()> {
        let handle = {
            let mut state = self.state.lock();
            let position = state
                .devices
                .iter()
                .position(|(n, _)| n == name)
                .ok_or_else(|| DaqError::UnknownDevice(name.to_string()))?;
            let (_, handle) = state.devices.remove(position);
            state.settings.branches.retain(|b| b.id != name);
            handle
        };
        handle.lock().die();
        info!(device = name, "Device removed");
        self.refresh_status();
        Ok(())
    }

    /// Device names in insertion order.
    pub fn device_names(&self) -> Vec<String> {
        self.state
            .lock()
            .devices
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Live status of one device, `None` if no device has that name.
    pub fn device_status(&self, name: &str) -> Option<StatusFlags> {
        let handle = self.state.lock().handle(name)?;
        let status = handle.lock().status();
        Some(status)
    }

    /// Whether the named device's producer is streaming.
    pub fn device_running(&self, name: &str) -> bool {
        let handle = self.state.lock().handle(name);
        handle.is_some_and(|h| h.lock().daq_running())
    }

    /// Aggregate status as of the last lifecycle or settings operation.
    pub fn status(&self) -> StatusFlags {
        self.state.lock().aggregate
    }

    /// Recompute the aggregate from every device.
    pub fn refresh_status(&self) -> StatusFlags {
        let statuses: Vec<StatusFlags> = self
            .handles()
            .iter()
            .map(|(_, handle)| handle.lock().status())
            .collect();
        let aggregate = StatusFlags::aggregate(statuses);
        self.state.lock().aggregate = aggregate;
        aggregate
    }

    fn handles(&self) -> Vec<(String, DeviceHandle)> {
        self.state
            .lock()
            .devices
            .iter()
            .map(|(name, handle)| (name.clone(), Arc::clone(handle)))
            .collect()
    }

    // ---------------------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------------------

    /// Record the profile and settings paths, apply saved settings if the file exists,
    /// and push them to the devices.
    pub fn initialize(
        &self,
        profile_path: impl Into<PathBuf>,
        settings_path: impl Into<PathBuf>,
    ) -> AppResult<()> {
        let profile_path = profile_path.into();
        let settings_path = settings_path.into();

        let mut tree = if settings_path.exists() {
            debug!(path = %settings_path.display(), "Loading saved settings");
            SettingNode::load_json(&settings_path)?
        } else {
            self.get_all_settings()
        };

        {
            let mut state = self.state.lock();
            state.profile_path = Some(profile_path);
            state.settings_path = Some(settings_path);
        }

        tree.id = SETTINGS_ROOT.to_string();
        self.rebuild_structure(&mut tree);
        self.push_settings(&tree)
    }

    /// Profile path recorded by [`initialize`](Self::initialize).
    pub fn profile_path(&self) -> Option<PathBuf> {
        self.state.lock().profile_path.clone()
    }

    /// Write the current settings tree to the settings path recorded by
    /// [`initialize`](Self::initialize), or to `path` if given.
    pub fn save_settings(&self, path: Option<&Path>) -> AppResult<()> {
        let target = match path {
            Some(path) => path.to_path_buf(),
            None => self.state.lock().settings_path.clone().ok_or_else(|| {
                DaqError::Configuration("No settings path recorded".to_string())
            })?,
        };
        self.pull_settings().save_json(&target)
    }

    /// Boot every device in insertion order. Failures are logged and do not stop the
    /// loop. Returns true iff every device ends up booted.
    #[instrument(skip(self))]
    pub fn boot(&self) -> bool {
        let handles = self.handles();
        let mut failed = Vec::new();

        for (name, handle) in &handles {
            let mut device = handle.lock();
            if device.status().is_booted() {
                continue;
            }
            if device.boot() {
                info!(device = %name, "Device booted");
            } else {
                warn!(device = %name, status = %device.status(), "Device failed to boot");
                failed.push(name.clone());
            }
        }

        let aggregate = self.refresh_status();
        self.pull_settings();

        if failed.is_empty() {
            info!(status = %aggregate, "All devices booted");
        } else {
            warn!(failed = ?failed, status = %aggregate, "Boot incomplete");
        }
        !handles.is_empty() && failed.is_empty()
    }

    /// Stop any acquisition, shut every device down, and reset the status to dead.
    pub fn die(&self) -> bool {
        let _control = self.control.lock();
        let acquisition = self.acquisition.lock().take();
        if let Some(acquisition) = acquisition {
            self.finish(acquisition);
        }

        let mut all = true;
        for (name, handle) in self.handles() {
            if !handle.lock().die() {
                warn!(device = %name, "Device did not shut down cleanly");
                all = false;
            }
        }
        self.state.lock().aggregate = StatusFlags::DEAD;
        info!("Engine shut down");
        all
    }

    // ---------------------------------------------------------------------------------
    // Acquisition
    // ---------------------------------------------------------------------------------

    /// Start every run-capable device and the MCA worker feeding `sink`.
    pub fn daq_start(&self, sink: SharedSink) -> bool {
        let _control = self.control.lock();
        self.reap_finished();

        if self.acquisition.lock().is_some() {
            warn!("Acquisition already running");
            return false;
        }

        let status = self.refresh_status();
        if !status.can(Capability::Run) {
            warn!(status = %status, "Cannot start acquisition: engine not ready");
            return false;
        }

        let queue: SpillSender = Arc::new(SpillQueue::with_poll_interval(self.poll_interval));
        self.cancel.store(false, Ordering::SeqCst);

        let started = self.start_devices(&queue);
        if started.is_empty() {
            warn!("No device started; acquisition aborted");
            self.refresh_status();
            return false;
        }

        let spawned = {
            let queue = Arc::clone(&queue);
            let cancel = Arc::clone(&self.cancel);
            let timeout = self.worker_timeout;
            thread::Builder::new()
                .name(worker::WORKER_THREAD_NAME.to_string())
                .spawn(move || worker::run(queue, sink, cancel, timeout))
        };

        match spawned {
            Ok(worker) => {
                info!(devices = started.len(), "Acquisition started");
                *self.acquisition.lock() = Some(Acquisition {
                    queue,
                    worker,
                    started,
                });
                self.refresh_status();
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to spawn MCA worker");
                Self::stop_devices(&started);
                self.refresh_status();
                false
            }
        }
    }

    /// Stop devices, then the worker once it has consumed everything they produced.
    pub fn daq_stop(&self) -> bool {
        let _control = self.control.lock();
        let acquisition = self.acquisition.lock().take();
        match acquisition {
            Some(acquisition) => {
                self.finish(acquisition);
                true
            }
            None => {
                debug!("daq_stop without a running acquisition");
                false
            }
        }
    }

    /// Whether the MCA worker is alive.
    pub fn daq_running(&self) -> bool {
        self.acquisition
            .lock()
            .as_ref()
            .is_some_and(|acquisition| !acquisition.worker.is_finished())
    }

    /// Report of the last finished acquisition.
    pub fn last_report(&self) -> Option<WorkerReport> {
        *self.last_report.lock()
    }

    /// Acquire into `sink` for `duration`, or until `cancel` is set.
    pub fn run_mca(&self, duration: Duration, sink: SharedSink, cancel: &AtomicBool) -> bool {
        if !self.daq_start(sink) {
            return false;
        }
        self.wait(duration, cancel);
        self.daq_stop()
    }

    /// Stream raw hits for `duration`, or until `cancel` is set, without a histogram.
    ///
    /// Blocks other start, stop and die calls until it returns.
    pub fn run_list(&self, duration: Duration, cancel: &AtomicBool) -> AppResult<ListData> {
        let _control = self.control.lock();
        self.reap_finished();
        if self.acquisition.lock().is_some() {
            return Err(DaqError::AlreadyRunning);
        }

        let status = self.refresh_status();
        if !status.can(Capability::Run) {
            return Err(DaqError::NotBooted(self.first_unready()));
        }

        let queue: SpillSender = Arc::new(SpillQueue::with_poll_interval(self.poll_interval));
        let mut run = RunInfo::begin(SETTINGS_ROOT);
        let started = self.start_devices(&queue);
        if started.is_empty() {
            return Err(DaqError::NotBooted(self.first_unready()));
        }
        info!(run = %run.id, devices = started.len(), "List-mode run started");

        self.wait(duration, cancel);
        Self::stop_devices(&started);

        let hits: Vec<Hit> = queue
            .drain()
            .into_iter()
            .filter(|spill| spill.kind == SpillKind::Data)
            .flat_map(|spill| spill.hits)
            .collect();
        run.finish(hits.len() as u64);
        info!(run = %run.id, hits = hits.len(), "List-mode run finished");

        self.refresh_status();
        Ok(ListData { run, hits })
    }

    /// Concatenated previews of every oscilloscope-capable device.
    pub fn oscilloscope(&self) -> Vec<Hit> {
        let mut traces = Vec::new();
        for (name, handle) in self.handles() {
            let mut device = handle.lock();
            if !device.status().can(Capability::Oscilloscope) {
                continue;
            }
            match device.oscilloscope() {
                Ok(mut hits) => traces.append(&mut hits),
                Err(e) => warn!(device = %name, error = %e, "Oscilloscope read failed"),
            }
        }
        traces
    }

    // ---------------------------------------------------------------------------------
    // Detectors
    // ---------------------------------------------------------------------------------

    /// Detector on each channel, indexed by channel. Unassigned channels hold
    /// [`Detector::default`].
    pub fn detectors(&self) -> Vec<Detector> {
        self.state.lock().detectors.clone()
    }

    /// Put `detector` on channel `index`, write its name into every device setting of
    /// type `Detector` with that index, and apply its optimization parameters to the
    /// channel.
    pub fn set_detector(&self, index: u16, detector: Detector) -> AppResult<()> {
        let address = settings::detector_address(index, &detector.name);
        let tree = {
            let mut state = self.state.lock();
            let slot = usize::from(index);
            if state.detectors.len() <= slot {
                state.detectors.resize_with(slot + 1, Detector::default);
            }
            debug!(index, detector = %detector.name, "Detector assigned");

            let mut tree = state.settings.clone();
            tree.set_setting(&address, settings::DETECTOR_MATCH);
            settings::apply_optimization(&mut tree, index, &detector);
            state.detectors[slot] = detector;
            tree
        };
        self.push_settings(&tree)
    }

    /// Apply the optimization parameters of every assigned detector to its channel and
    /// push the result.
    pub fn load_optimization(&self) -> AppResult<()> {
        let tree = {
            let state = self.state.lock();
            let mut tree = state.settings.clone();
            for (index, detector) in state.detectors.iter().enumerate() {
                let Ok(index) = u16::try_from(index) else {
                    break;
                };
                if !detector.is_none() {
                    settings::apply_optimization(&mut tree, index, detector);
                }
            }
            tree
        };
        self.push_settings(&tree)
    }

    // ---------------------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------------------

    fn start_devices(&self, queue: &SpillSender) -> Vec<(String, DeviceHandle)> {
        let mut started = Vec::new();
        for (name, handle) in self.handles() {
            let mut device = handle.lock();
            if !device.status().can(Capability::Run) {
                debug!(device = %name, "Skipping device without run capability");
                continue;
            }
            if !device.daq_init() {
                warn!(device = %name, "daq_init failed");
                continue;
            }
            if device.daq_start(Arc::clone(queue)) {
                debug!(device = %name, "Device streaming");
                drop(device);
                started.push((name, handle));
            } else {
                warn!(device = %name, "Device failed to start");
            }
        }
        started
    }

    fn stop_devices(started: &[(String, DeviceHandle)]) {
        for (name, handle) in started {
            if !handle.lock().daq_stop() {
                warn!(device = %name, "Device did not stop cleanly");
            }
        }
    }

    /// Producers are joined before the terminator goes in, so everything they pushed
    /// reaches the sink.
    fn finish(&self, acquisition: Acquisition) {
        let Acquisition {
            queue,
            worker,
            started,
        } = acquisition;

        Self::stop_devices(&started);
        queue.push(Spill::terminator());
        self.cancel.store(true, Ordering::SeqCst);
        queue.wake_all();

        match worker.join() {
            Ok(report) => {
                info!(
                    spills = report.spills(),
                    hits = report.hits,
                    "Acquisition stopped"
                );
                *self.last_report.lock() = Some(report);
            }
            Err(_) => error!("MCA worker panicked; histogram may be incomplete"),
        }

        let leftover = queue.drain();
        if !leftover.is_empty() {
            warn!(spills = leftover.len(), "Discarding spills left after the worker exited");
        }
        self.refresh_status();
    }

    /// Clean up after a worker that exited on its own.
    fn reap_finished(&self) {
        let finished = {
            let mut acquisition = self.acquisition.lock();
            if acquisition
                .as_ref()
                .is_some_and(|a| a.worker.is_finished())
            {
                acquisition.take()
            } else {
                None
            }
        };
        if let Some(acquisition) = finished {
            warn!("Reaping acquisition whose worker already exited");
            self.finish(acquisition);
        }
    }

    /// Sleep in poll slices until `duration` passes or `cancel` is set. A duration too
    /// long to represent as an instant waits for `cancel` only.
    fn wait(&self, duration: Duration, cancel: &AtomicBool) {
        let deadline = Instant::now().checked_add(duration);
        loop {
            if cancel.load(Ordering::SeqCst) {
                debug!("Run cancelled");
                return;
            }
            let now = Instant::now();
            let slice = match deadline {
                Some(deadline) if now >= deadline => return,
                Some(deadline) => (deadline - now).min(self.poll_interval),
                None => self.poll_interval,
            };
            thread::sleep(slice);
        }
    }

    fn first_unready(&self) -> String {
        self.handles()
            .into_iter()
            .find(|(_, handle)| !handle.lock().status().can(Capability::Run))
            .map(|(name, _)| name)
            .unwrap_or_else(|| SETTINGS_ROOT.to_string())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.die();
    }
}
