//! Detector descriptors.
//!
//! A detector is what sits on an analyzer channel: a named crystal or tube with its own
//! optimization parameters. The engine keeps one descriptor per channel and writes the
//! name into every device setting of type `Detector` with the same channel index.
//! Each optimization parameter is copied onto the device setting with the same name
//! and channel index.

use serde::{Deserialize, Serialize};

use crate::setting::{SettingNode, SettingValue};

/// Id of the stem holding a detector's optimization parameters.
pub const OPTIMIZATION_STEM: &str = "Optimization";

/// Placeholder name for an unassigned channel.
pub const NO_DETECTOR: &str = "none";

/// A detector attached to one analyzer channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detector {
    /// Unique name, written into the device's `Detector` settings.
    pub name: String,
    /// Detector family, e.g. "HPGe" or "NaI(Tl)".
    pub kind: String,
    /// Optimization parameters (stem [`OPTIMIZATION_STEM`]).
    pub settings: SettingNode,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new(NO_DETECTOR, "")
    }
}

impl Detector {
    /// Detector with no optimization parameters.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            settings: SettingNode::stem(OPTIMIZATION_STEM),
        }
    }

    /// Add an optimization parameter.
    pub fn with_parameter(mut self, id: impl Into<String>, value: SettingValue) -> Self {
        self.settings = self
            .settings
            .with_branch(SettingNode::stem(id).with_value(value));
        self
    }

    /// Whether this is the unassigned placeholder.
    pub fn is_none(&self) -> bool {
        self.name == NO_DETECTOR
    }

    /// Value of an optimization parameter.
    pub fn parameter(&self, id: &str) -> Option<&SettingValue> {
        self.settings.branch(id).map(|node| &node.value)
    }
}
