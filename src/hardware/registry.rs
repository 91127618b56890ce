//! Source registry.
//!
//! Maps a `type` string from the configuration file to a factory that builds the
//! matching [`Source`]. Each factory receives the device id and its `config` table.
//!
//! ```toml
//! [[devices]]
//! id = "sim0"
//! type = "simulator"
//! config = { count_rate = 5000.0 }
//! ```

use std::collections::HashMap;

use toml::Value;
use tracing::debug;

use crate::error::{AppResult, DaqError};
use crate::hardware::mock::{MockConfig, MockSource};
use crate::hardware::simulator::{Simulator, SimulatorConfig};
use crate::source::Source;

/// Builds a source from a device id and its configuration table.
pub type SourceFactory = Box<dyn Fn(&str, &Value) -> AppResult<Box<dyn Source>> + Send + Sync>;

/// Type-name to factory lookup.
pub struct SourceRegistry {
    factories: HashMap<String, SourceFactory>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl SourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the `mock` and `simulator` backends.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register(
            "mock",
            Box::new(|id, config| {
                let mock_config: MockConfig = parse_config(id, config)?;
                Ok(Box::new(MockSource::from_config(id, mock_config)))
            }),
        );

        registry.register(
            "simulator",
            Box::new(|id, config| {
                let sim_config: SimulatorConfig = parse_config(id, config)?;
                Ok(Box::new(Simulator::from_config(id, sim_config)))
            }),
        );

        registry
    }

    /// Add or replace the factory for `type_name`.
    pub fn register(&mut self, type_name: impl Into<String>, factory: SourceFactory) {
        let type_name = type_name.into();
        debug!(plugin = %type_name, "Registering source plugin");
        self.factories.insert(type_name, factory);
    }

    /// Build a source of type `type_name` named `id`.
    pub fn create(&self, type_name: &str, id: &str, config: &Value) -> AppResult<Box<dyn Source>> {
        self.factories
            .get(type_name)
            .ok_or_else(|| DaqError::UnknownPlugin(type_name.to_string()))
            .and_then(|factory| factory(id, config))
    }

    /// Registered type names, sorted.
    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(id: &str, config: &Value) -> AppResult<T> {
    config
        .clone()
        .try_into()
        .map_err(|e| DaqError::Configuration(format!("device '{id}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusFlags;

    #[test]
    fn test_builtin_plugins() {
        let registry = SourceRegistry::with_builtins();
        assert_eq!(registry.plugin_names(), vec!["mock", "simulator"]);

        let source = registry
            .create("simulator", "sim0", &Value::Table(Default::default()))
            .unwrap();
        assert_eq!(source.device_name(), "sim0");
        assert_eq!(source.plugin_name(), "simulator");
        assert_eq!(source.status(), StatusFlags::loaded());
    }

    #[test]
    fn test_unknown_plugin() {
        let registry = SourceRegistry::with_builtins();
        let err = registry
            .create("vme", "crate0", &Value::Table(Default::default()))
            .err()
            .unwrap();
        assert!(matches!(err, DaqError::UnknownPlugin(name) if name == "vme"));
    }

    #[test]
    fn test_bad_config_is_rejected() {
        let registry = SourceRegistry::with_builtins();
        let config: Value = toml::from_str("hits_per_spill = \"many\"").unwrap();
        let err = registry.create("mock", "m", &config).err().unwrap();
        assert!(matches!(err, DaqError::Configuration(msg) if msg.contains("'m'")));
    }

    #[test]
    fn test_custom_factory() {
        let mut registry = SourceRegistry::new();
        registry.register(
            "always_failing",
            Box::new(|id, _| Ok(Box::new(MockSource::new(id).failing_boot()))),
        );
        let mut source = registry
            .create("always_failing", "x", &Value::Table(Default::default()))
            .unwrap();
        assert!(!source.boot());
    }
}
