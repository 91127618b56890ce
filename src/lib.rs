//! # MCA DAQ Core Library
//!
//! Acquisition engine for multi-channel analyzer hardware. Devices stream batches of
//! hits ("spills") from their own threads into a shared queue; the engine's MCA worker
//! folds them into energy histograms while control code boots devices, starts and
//! stops runs, and reconciles a hierarchical settings tree with the hardware.
//!
//! ## Crate Structure
//!
//! - **`status`**: `StatusFlags` bit set and its engine-wide aggregation.
//! - **`spill`**: `Spill`, `Hit` and `RunInfo`, the values that move through the queue.
//! - **`queue`**: `SpillQueue`, a blocking FIFO whose waits can be cancelled.
//! - **`setting`**: self-describing settings tree (`SettingNode`, `SettingMeta`) and the
//!   per-device `SettingStore`.
//! - **`source`**: the `Source` trait every acquisition backend implements.
//! - **`hardware`**: built-in backends (`MockSource`, `Simulator`) and the registry that
//!   creates them from configuration.
//! - **`histogram`**: `HistogramSink` and the in-memory `Histogram`.
//! - **`detector`**: detector descriptors attached to analyzer channels.
//! - **`engine`**: the `Engine` orchestrator, settings reconciliation and the MCA worker.
//! - **`config`**, **`logging`**, **`error`**: configuration loading, tracing setup and
//!   the crate error type.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use std::sync::atomic::AtomicBool;
//! use mca_daq::engine::Engine;
//! use mca_daq::hardware::Simulator;
//! use mca_daq::histogram::{Histogram, HistogramSink};
//!
//! let engine = Engine::new();
//! engine.add_device("sim0", Box::new(Simulator::new("sim0")))?;
//! engine.boot();
//!
//! let histogram = Histogram::shared(12);
//! engine.run_mca(Duration::from_secs(5), histogram.clone(), &AtomicBool::new(false));
//! println!("{} hits", histogram.snapshot().total_hits);
//! # Ok::<(), mca_daq::error::DaqError>(())
//! ```

pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod histogram;
pub mod logging;
pub mod queue;
pub mod setting;
pub mod source;
pub mod spill;
pub mod status;

pub use engine::Engine;
pub use error::{AppResult, DaqError};
pub use source::Source;
pub use spill::{Hit, Spill};
pub use status::StatusFlags;
