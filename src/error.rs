//! Custom error types for the acquisition engine.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides one consistent way to report the
//! failures that can occur while configuring, booting and streaming from
//! acquisition devices.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: file-level and semantic configuration problems.
//! - **`UnknownSetting`** / **`OutOfBounds`** / **`WrongDevice`**: a device rejected a
//!   settings write. These always name the device and the offending setting id so the
//!   caller can tell exactly what was refused.
//! - **`SettingsRejected`**: the engine-level wrapper produced by `Engine::push_settings`
//!   when one device in the chain rejects its subtree.
//! - **`NotBooted`** / **`AlreadyRunning`** / **`NotRunning`**: lifecycle misuse.
//! - **`Hardware`** / **`ProducerPanicked`**: device faults. These are logged and converted
//!   to boolean failures at the device boundary; they never cross into the engine as panics.
//!
//! Public engine operations report success as `bool`; the `Result`-returning paths exist
//! where the caller needs to know *which* device or setting failed.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by the engine, its devices and the configuration layer.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Device '{0}' is not registered with the engine")]
    UnknownDevice(String),

    #[error("No device plugin registered under type '{0}'")]
    UnknownPlugin(String),

    #[error("Device '{device}' has no setting '{id}'")]
    UnknownSetting { device: String, id: String },

    #[error("Device '{device}' rejected '{id}': {reason}")]
    OutOfBounds {
        device: String,
        id: String,
        reason: String,
    },

    #[error("Settings subtree '{found}' does not belong to device '{expected}'")]
    WrongDevice { expected: String, found: String },

    #[error("Device '{device}' rejected settings: {source}")]
    SettingsRejected {
        device: String,
        #[source]
        source: Box<DaqError>,
    },

    #[error("Device '{0}' is not booted")]
    NotBooted(String),

    #[error("Acquisition is already running")]
    AlreadyRunning,

    #[error("Acquisition is not running")]
    NotRunning,

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Producer thread for '{0}' panicked")]
    ProducerPanicked(String),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// Name of the device this error is attributed to, if any.
    pub fn device(&self) -> Option<&str> {
        match self {
            DaqError::UnknownSetting { device, .. }
            | DaqError::OutOfBounds { device, .. }
            | DaqError::SettingsRejected { device, .. } => Some(device),
            DaqError::WrongDevice { expected, .. } => Some(expected),
            DaqError::NotBooted(device)
            | DaqError::UnknownDevice(device)
            | DaqError::ProducerPanicked(device) => Some(device),
            _ => None,
        }
    }

    /// Setting id this error is attributed to, looking through `SettingsRejected`.
    pub fn setting_id(&self) -> Option<&str> {
        match self {
            DaqError::UnknownSetting { id, .. } | DaqError::OutOfBounds { id, .. } => Some(id),
            DaqError::SettingsRejected { source, .. } => source.setting_id(),
            _ => None,
        }
    }

    /// Whether the engine can keep operating after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            DaqError::Config(_) | DaqError::Configuration(_) | DaqError::ProducerPanicked(_)
        )
    }
}
