//! Acquisition device abstraction.
//!
//! A [`Source`] is one physical (or simulated) acquisition backend. The engine owns every
//! source exclusively, calls into it from control threads, and hands it a shared
//! [`SpillQueue`] to stream into while acquisition runs.
//!
//! # Contract
//!
//! - `boot()` sets `BOOTED` on success and leaves the status untouched on failure. It can
//!   be retried.
//! - `die()` is idempotent, never panics, and leaves the device not running with status
//!   [`StatusFlags::DEAD`]. A dead instance can be booted again.
//! - `daq_start()` fails, without touching the queue, unless the device is booted with
//!   `CAN_RUN`. `daq_stop()` returns only after the producer thread has exited; no spill
//!   is pushed afterwards.
//! - `write_settings_bulk()` rejects unknown ids instead of ignoring them.
//! - `oscilloscope()` is an explicit capability: devices without `CAN_OSCILLOSCOPE`
//!   return [`DaqError::Unsupported`](crate::error::DaqError::Unsupported).
//!
//! Hardware failures are caught inside the implementation, logged, and reported as
//! `false`; they must never unwind into the engine.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::AppResult;
use crate::queue::SpillQueue;
use crate::setting::{SettingMeta, SettingNode};
use crate::spill::{Hit, Spill};
use crate::status::StatusFlags;

/// Queue handle passed to devices on `daq_start`.
pub type SpillSender = Arc<SpillQueue<Spill>>;

/// One acquisition backend.
pub trait Source: Send {
    /// Registry type-name of the backend (e.g. `"simulator"`).
    fn plugin_name(&self) -> &'static str;

    /// Instance name; also the id of this device's settings subtree.
    fn device_name(&self) -> &str;

    /// Current readiness flags.
    fn status(&self) -> StatusFlags;

    /// Profile the device loads its definitions from, if any.
    fn profile_path(&self) -> Option<&Path> {
        None
    }

    /// Setting definitions keyed by id.
    fn setting_definitions(&self) -> &BTreeMap<String, SettingMeta>;

    /// Bring the hardware online, re-loading first if the device is dead.
    fn boot(&mut self) -> bool;

    /// Release hardware resources and reset the status to dead.
    fn die(&mut self) -> bool;

    /// Prepare for a run. Called right before `daq_start`.
    fn daq_init(&mut self) -> bool {
        true
    }

    /// Start streaming spills into `queue` from an internal thread.
    fn daq_start(&mut self, queue: SpillSender) -> bool;

    /// Stop streaming and join the producer thread.
    fn daq_stop(&mut self) -> bool;

    /// Whether the producer thread is alive.
    fn daq_running(&self) -> bool;

    /// Fill `set` (whose id must be `device_name()`) with live values.
    fn read_settings_bulk(&self, set: &mut SettingNode) -> bool;

    /// Apply `set` (whose id must be `device_name()`).
    fn write_settings_bulk(&mut self, set: &SettingNode) -> AppResult<()>;

    /// Run command-type settings whose value is 1, resetting them to 0.
    fn execute_command(&mut self, set: &mut SettingNode) -> bool;

    /// Snapshot of recent raw samples for preview.
    fn oscilloscope(&mut self) -> AppResult<Vec<Hit>>;
}
