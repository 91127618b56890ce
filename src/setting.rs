//! Hierarchical, self-describing settings tree.
//!
//! A [`SettingNode`] carries an id, its [`SettingMeta`] (type, bounds, display info), a
//! scalar [`SettingValue`] and an ordered list of child branches. The same structure is
//! used to describe what a device supports and to report its live values.
//!
//! Nodes are keyed by id. [`SettingNode::merge`] and [`SettingNode::reconcile`] are
//! idempotent: merging the same subtree twice leaves the tree exactly as merging it once.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{AppResult, DaqError};

/// Kind of value a setting holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingType {
    /// Container for child settings.
    #[default]
    Stem,
    Boolean,
    Integer,
    Floating,
    Text,
    /// Writing 1 triggers an action; the device resets it to 0.
    Command,
    /// Read-only live value.
    Indicator,
    FilePath,
    /// Name of the detector attached to a channel.
    Detector,
}

/// Scalar value of a setting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SettingValue {
    /// Numeric view used for bounds checks.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Int(v) => Some(*v as f64),
            SettingValue::Float(v) => Some(*v),
            SettingValue::Bool(v) => Some(f64::from(u8::from(*v))),
            SettingValue::None | SettingValue::Text(_) => None,
        }
    }

    /// Integer view, truncating floats.
    pub fn as_i64(&self) -> Option<i64> {
        self.as_f64().map(|v| v as i64)
    }

    /// Text view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Definition of a setting: type, bounds and display information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingMeta {
    /// Full id, prefixed with the device name.
    pub id: String,
    /// Display name; defaults to the last id segment.
    #[serde(default)]
    pub name: String,
    /// Free-form help text.
    #[serde(default)]
    pub description: String,
    /// Value kind.
    #[serde(default)]
    pub setting_type: SettingType,
    /// Inclusive lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    /// Inclusive upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    /// UI increment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    /// Physical unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Accepted by `write_settings_bulk`.
    #[serde(default = "default_writable")]
    pub writable: bool,
    /// Channel index for per-channel settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u16>,
}

fn default_writable() -> bool {
    true
}

impl SettingMeta {
    /// Writable definition of the given type.
    pub fn new(id: impl Into<String>, setting_type: SettingType) -> Self {
        let id = id.into();
        Self {
            name: id.rsplit('/').next().unwrap_or_default().to_string(),
            id,
            setting_type,
            writable: !matches!(setting_type, SettingType::Indicator | SettingType::Stem),
            ..Default::default()
        }
    }

    /// Inclusive numeric bounds.
    pub fn with_bounds(mut self, minimum: f64, maximum: f64) -> Self {
        self.minimum = Some(minimum);
        self.maximum = Some(maximum);
        self
    }

    /// UI increment.
    pub fn with_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    /// Physical unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Help text.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Channel index for per-channel settings.
    pub fn with_index(mut self, index: u16) -> Self {
        self.index = Some(index);
        self
    }

    /// Value a fresh node of this definition starts with.
    pub fn default_value(&self) -> SettingValue {
        match self.setting_type {
            SettingType::Stem => SettingValue::None,
            SettingType::Boolean => SettingValue::Bool(false),
            SettingType::Integer | SettingType::Command => {
                SettingValue::Int(self.minimum.map(|m| m as i64).unwrap_or(0))
            }
            SettingType::Floating | SettingType::Indicator => {
                SettingValue::Float(self.minimum.unwrap_or(0.0))
            }
            SettingType::Text | SettingType::FilePath | SettingType::Detector => {
                SettingValue::Text(String::new())
            }
        }
    }

    /// Check type compatibility and bounds; returns the reason on failure.
    pub fn check(&self, value: &SettingValue) -> Result<(), String> {
        let type_ok = match (self.setting_type, value) {
            (_, SettingValue::None) => true,
            (SettingType::Boolean, SettingValue::Bool(_)) => true,
            (SettingType::Integer | SettingType::Command, SettingValue::Int(_)) => true,
            (SettingType::Floating | SettingType::Indicator, SettingValue::Float(_))
            | (SettingType::Floating | SettingType::Indicator, SettingValue::Int(_)) => true,
            (
                SettingType::Text | SettingType::FilePath | SettingType::Detector,
                SettingValue::Text(_),
            ) => true,
            _ => false,
        };
        if !type_ok {
            return Err(format!("{value:?} is not a {:?} value", self.setting_type));
        }

        if let Some(v) = value.as_f64() {
            if let Some(min) = self.minimum.filter(|min| v < *min) {
                return Err(format!("{v} is below minimum {min}"));
            }
            if let Some(max) = self.maximum.filter(|max| v > *max) {
                return Err(format!("{v} is above maximum {max}"));
            }
        }
        Ok(())
    }
}

bitflags! {
    /// Which fields must agree for [`SettingNode::set_setting`] to address a node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MatchFlags: u8 {
        /// Full id.
        const ID = 1 << 0;
        /// Channel index.
        const INDEX = 1 << 1;
        /// Setting type.
        const TYPE = 1 << 2;
        /// Last path segment of the id (`metadata.name`), for device-independent addressing.
        const NAME = 1 << 3;
    }
}

/// One node of the settings tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingNode {
    /// Unique id.
    pub id: String,
    /// Definition of this node.
    #[serde(default)]
    pub metadata: SettingMeta,
    /// Current value; `None` for stems.
    #[serde(default)]
    pub value: SettingValue,
    /// Children, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<SettingNode>,
}

impl SettingNode {
    /// Empty container node.
    pub fn stem(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            metadata: SettingMeta::new(id.clone(), SettingType::Stem),
            id,
            value: SettingValue::None,
            branches: Vec::new(),
        }
    }

    /// Node for a definition, holding its default value.
    pub fn from_meta(meta: &SettingMeta) -> Self {
        Self {
            id: meta.id.clone(),
            value: meta.default_value(),
            metadata: meta.clone(),
            branches: Vec::new(),
        }
    }

    /// Builder-style value setter.
    pub fn with_value(mut self, value: SettingValue) -> Self {
        self.value = value;
        self
    }

    /// Builder-style child append.
    pub fn with_branch(mut self, branch: SettingNode) -> Self {
        self.branches.push(branch);
        self
    }

    /// Direct child by id.
    pub fn branch(&self, id: &str) -> Option<&SettingNode> {
        self.branches.iter().find(|b| b.id == id)
    }

    /// Direct child by id, mutable.
    pub fn branch_mut(&mut self, id: &str) -> Option<&mut SettingNode> {
        self.branches.iter_mut().find(|b| b.id == id)
    }

    /// Existing child with `template.id`, or `template` appended.
    pub fn upsert_branch(&mut self, template: SettingNode) -> &mut SettingNode {
        let position = match self.branches.iter().position(|b| b.id == template.id) {
            Some(position) => position,
            None => {
                self.branches.push(template);
                self.branches.len() - 1
            }
        };
        &mut self.branches[position]
    }

    /// Depth-first search by id, including `self`.
    pub fn find(&self, id: &str) -> Option<&SettingNode> {
        if self.id == id {
            return Some(self);
        }
        self.branches.iter().find_map(|b| b.find(id))
    }

    /// Depth-first search by id, mutable.
    pub fn find_mut(&mut self, id: &str) -> Option<&mut SettingNode> {
        if self.id == id {
            return Some(self);
        }
        self.branches.iter_mut().find_map(|b| b.find_mut(id))
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.branches.iter().map(SettingNode::node_count).sum::<usize>()
    }

    /// Whether `self` is addressed by `address` under `flags`.
    pub fn matches(&self, address: &SettingNode, flags: MatchFlags) -> bool {
        (!flags.contains(MatchFlags::ID) || self.id == address.id)
            && (!flags.contains(MatchFlags::INDEX)
                || self.metadata.index == address.metadata.index)
            && (!flags.contains(MatchFlags::TYPE)
                || self.metadata.setting_type == address.metadata.setting_type)
            && (!flags.contains(MatchFlags::NAME) || self.metadata.name == address.metadata.name)
    }

    /// Copy `address.value` into every node it matches. Returns how many were updated.
    pub fn set_setting(&mut self, address: &SettingNode, flags: MatchFlags) -> usize {
        let mut updated = 0;
        if self.metadata.setting_type != SettingType::Stem && self.matches(address, flags) {
            self.value = address.value.clone();
            updated += 1;
        }
        for branch in &mut self.branches {
            updated += branch.set_setting(address, flags);
        }
        updated
    }

    /// Merge `other` into `self` by id.
    ///
    /// Values and metadata from `other` overwrite; children of `other` that `self` lacks
    /// are appended; children only `self` has are kept.
    pub fn merge(&mut self, other: &SettingNode) {
        if !other.metadata.id.is_empty() {
            self.metadata = other.metadata.clone();
        }
        self.value = other.value.clone();
        for incoming in &other.branches {
            match self.branch_mut(&incoming.id) {
                Some(existing) => existing.merge(incoming),
                None => self.branches.push(incoming.clone()),
            }
        }
    }

    /// Bring this subtree in line with a device's definitions.
    ///
    /// Existing values are preserved, definitions without a node are appended with their
    /// default value, and nodes whose id is no longer defined are pruned.
    pub fn reconcile(&mut self, definitions: &BTreeMap<String, SettingMeta>) {
        self.branches.retain(|b| definitions.contains_key(&b.id));
        for branch in &mut self.branches {
            if let Some(meta) = definitions.get(&branch.id) {
                branch.metadata = meta.clone();
            }
        }
        for meta in definitions.values() {
            if self.branch(&meta.id).is_none() {
                self.branches.push(SettingNode::from_meta(meta));
            }
        }
    }

    /// Fill in metadata from definitions for every node in the subtree with a known id.
    pub fn enrich(&mut self, definitions: &BTreeMap<String, SettingMeta>) {
        if let Some(meta) = definitions.get(&self.id) {
            self.metadata = meta.clone();
        }
        for branch in &mut self.branches {
            branch.enrich(definitions);
        }
    }

    /// Read a tree from a JSON file.
    pub fn load_json(path: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write this tree to a JSON file.
    pub fn save_json(&self, path: &Path) -> AppResult<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Setting definitions plus current values for one device.
///
/// Devices embed a store and delegate their bulk read/write to it, so every backend
/// applies the same rejection rules.
#[derive(Debug, Clone, Default)]
pub struct SettingStore {
    definitions: BTreeMap<String, SettingMeta>,
    values: BTreeMap<String, SettingValue>,
}

impl SettingStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a definition; the value is reset only for new ids.
    pub fn define(&mut self, meta: SettingMeta) {
        self.values
            .entry(meta.id.clone())
            .or_insert_with(|| meta.default_value());
        self.definitions.insert(meta.id.clone(), meta);
    }

    /// Replace all definitions, keeping values of ids that survive.
    pub fn replace_definitions(&mut self, definitions: BTreeMap<String, SettingMeta>) {
        self.values.retain(|id, _| definitions.contains_key(id));
        for meta in definitions.into_values() {
            self.define(meta);
        }
    }

    /// Definitions keyed by id.
    pub fn definitions(&self) -> &BTreeMap<String, SettingMeta> {
        &self.definitions
    }

    /// Current value of a setting.
    pub fn get(&self, id: &str) -> Option<&SettingValue> {
        self.values.get(id)
    }

    /// Device-side write, bypassing the writable flag (used for indicators).
    pub fn set_internal(&mut self, id: &str, value: SettingValue) {
        if self.definitions.contains_key(id) {
            self.values.insert(id.to_string(), value);
        }
    }

    /// Apply a device subtree in order.
    ///
    /// Stops at the first unknown id or out-of-bounds value. Branches before the
    /// rejected one stay applied. Read-only branches are skipped.
    pub fn apply(&mut self, device: &str, set: &SettingNode) -> AppResult<()> {
        if set.id != device {
            return Err(DaqError::WrongDevice {
                expected: device.to_string(),
                found: set.id.clone(),
            });
        }

        for branch in &set.branches {
            let meta = self
                .definitions
                .get(&branch.id)
                .ok_or_else(|| DaqError::UnknownSetting {
                    device: device.to_string(),
                    id: branch.id.clone(),
                })?;
            if !meta.writable {
                continue;
            }
            meta.check(&branch.value)
                .map_err(|reason| DaqError::OutOfBounds {
                    device: device.to_string(),
                    id: branch.id.clone(),
                    reason,
                })?;
            if branch.value != SettingValue::None {
                self.values.insert(branch.id.clone(), branch.value.clone());
            }
        }
        Ok(())
    }

    /// Write live values into a device subtree, reconciling its structure first.
    pub fn fill(&self, set: &mut SettingNode) {
        set.reconcile(&self.definitions);
        for branch in &mut set.branches {
            if let Some(value) = self.values.get(&branch.id) {
                branch.value = value.clone();
            }
        }
    }

    /// Load definitions from a JSON array of [`SettingMeta`].
    pub fn load_definitions(&mut self, path: &Path) -> AppResult<()> {
        let text = fs::read_to_string(path)?;
        let metas: Vec<SettingMeta> = serde_json::from_str(&text)?;
        self.replace_definitions(metas.into_iter().map(|m| (m.id.clone(), m)).collect());
        Ok(())
    }

    /// Save definitions as a JSON array.
    pub fn save_definitions(&self, path: &Path) -> AppResult<()> {
        let metas: Vec<&SettingMeta> = self.definitions.values().collect();
        fs::write(path, serde_json::to_string_pretty(&metas)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definitions() -> BTreeMap<String, SettingMeta> {
        [
            SettingMeta::new("dev/Gain", SettingType::Floating).with_bounds(0.0, 10.0),
            SettingMeta::new("dev/Threshold", SettingType::Integer).with_bounds(0.0, 4095.0),
        ]
        .into_iter()
        .map(|m| (m.id.clone(), m))
        .collect()
    }

    #[test]
    fn test_reconcile_appends_and_prunes() {
        let mut node = SettingNode::stem("dev")
            .with_branch(SettingNode::stem("dev/Stale"))
            .with_branch(
                SettingNode::from_meta(&definitions()["dev/Gain"]).with_value(SettingValue::Float(2.5)),
            );

        node.reconcile(&definitions());

        let ids: Vec<&str> = node.branches.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["dev/Gain", "dev/Threshold"]);
        assert_eq!(node.branches[0].value, SettingValue::Float(2.5));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let incoming = SettingNode::stem("dev")
            .with_branch(SettingNode::from_meta(&definitions()["dev/Gain"]).with_value(SettingValue::Float(1.0)));

        let mut once = SettingNode::stem("root");
        once.upsert_branch(SettingNode::stem("dev")).merge(&incoming);
        let mut twice = once.clone();
        twice.upsert_branch(SettingNode::stem("dev")).merge(&incoming);

        assert_eq!(once, twice);
        assert_eq!(twice.node_count(), 3);
    }

    #[test]
    fn test_store_rejects_unknown_id_after_applying_prefix() {
        let mut store = SettingStore::new();
        for meta in definitions().into_values() {
            store.define(meta);
        }

        let set = SettingNode::stem("dev")
            .with_branch(SettingNode::stem("dev/Gain").with_value(SettingValue::Float(3.0)))
            .with_branch(SettingNode::stem("dev/Bogus").with_value(SettingValue::Int(1)))
            .with_branch(SettingNode::stem("dev/Threshold").with_value(SettingValue::Int(9)));

        let err = store.apply("dev", &set).unwrap_err();
        assert_eq!(err.setting_id(), Some("dev/Bogus"));
        assert_eq!(store.get("dev/Gain"), Some(&SettingValue::Float(3.0)));
        assert_eq!(store.get("dev/Threshold"), Some(&SettingValue::Int(0)));
    }

    #[test]
    fn test_store_rejects_out_of_bounds() {
        let mut store = SettingStore::new();
        for meta in definitions().into_values() {
            store.define(meta);
        }
        let set = SettingNode::stem("dev")
            .with_branch(SettingNode::stem("dev/Gain").with_value(SettingValue::Float(11.0)));
        assert!(matches!(
            store.apply("dev", &set),
            Err(DaqError::OutOfBounds { .. })
        ));
        assert!(matches!(
            store.apply("other", &SettingNode::stem("other2")),
            Err(DaqError::WrongDevice { .. })
        ));
    }

    #[test]
    fn test_set_setting_by_index() {
        let meta = SettingMeta::new("dev/Detector", SettingType::Detector).with_index(1);
        let mut tree = SettingNode::stem("root").with_branch(SettingNode::from_meta(&meta));

        let mut address = SettingNode::stem("any").with_value(SettingValue::Text("HPGe".into()));
        address.metadata.index = Some(1);
        address.metadata.setting_type = SettingType::Detector;

        assert_eq!(tree.set_setting(&address, MatchFlags::INDEX | MatchFlags::TYPE), 1);
        assert_eq!(
            tree.find("dev/Detector").map(|n| n.value.clone()),
            Some(SettingValue::Text("HPGe".into()))
        );
    }

    #[test]
    fn test_set_setting_by_name_and_index() {
        let mut tree = SettingNode::stem("root")
            .with_branch(SettingNode::from_meta(
                &SettingMeta::new("a/Channel0/Gain", SettingType::Floating).with_index(0),
            ))
            .with_branch(SettingNode::from_meta(
                &SettingMeta::new("a/Channel1/Gain", SettingType::Floating).with_index(1),
            ))
            .with_branch(SettingNode::from_meta(
                &SettingMeta::new("a/Channel1/Offset", SettingType::Floating).with_index(1),
            ));

        let mut address = SettingNode::stem("Gain").with_value(SettingValue::Float(1.5));
        address.metadata.index = Some(1);

        assert_eq!(tree.set_setting(&address, MatchFlags::NAME | MatchFlags::INDEX), 1);
        assert_eq!(
            tree.find("a/Channel1/Gain").map(|n| n.value.clone()),
            Some(SettingValue::Float(1.5))
        );
        assert_eq!(
            tree.find("a/Channel0/Gain").map(|n| n.value.clone()),
            Some(SettingValue::Float(0.0))
        );
    }

    #[test]
    fn test_definitions_json_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("defs.json");

        let mut store = SettingStore::new();
        for meta in definitions().into_values() {
            store.define(meta);
        }
        store.save_definitions(&path).unwrap();

        let mut loaded = SettingStore::new();
        loaded.load_definitions(&path).unwrap();
        assert_eq!(loaded.definitions(), store.definitions());
    }
}
