//! Settings-tree reconciliation between the engine and its devices.
//!
//! The engine tree has one stem per device (id = device name). Device values are the
//! source of truth: every push is followed by a read so the engine tree shows what the
//! hardware actually accepted.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use super::{Engine, SETTINGS_ROOT};
use crate::detector::Detector;
use crate::error::{AppResult, DaqError};
use crate::setting::{MatchFlags, SettingMeta, SettingNode, SettingType, SettingValue};

/// How [`Engine::set_detector`] addresses per-channel detector settings.
pub(super) const DETECTOR_MATCH: MatchFlags = MatchFlags::INDEX.union(MatchFlags::TYPE);

/// Address node matching every `Detector` setting on channel `index`.
pub(super) fn detector_address(index: u16, name: &str) -> SettingNode {
    let mut address = SettingNode::stem("");
    address.metadata = SettingMeta::new("", SettingType::Detector).with_index(index);
    address.value = SettingValue::Text(name.to_string());
    address
}

/// How detector optimization parameters address per-channel device settings.
pub(super) const OPTIMIZATION_MATCH: MatchFlags = MatchFlags::NAME.union(MatchFlags::INDEX);

/// Write each optimization parameter of `detector` into the settings of channel `index`
/// with the same name. Returns how many nodes were updated.
pub(super) fn apply_optimization(tree: &mut SettingNode, index: u16, detector: &Detector) -> usize {
    let mut updated = 0;
    for parameter in &detector.settings.branches {
        let mut address = parameter.clone();
        address.metadata.index = Some(index);
        let matched = tree.set_setting(&address, OPTIMIZATION_MATCH);
        if matched == 0 {
            debug!(index, detector = %detector.name, parameter = %parameter.id, "No channel setting for parameter");
        }
        updated += matched;
    }
    updated
}

/// Bring `branch` in line with `definitions`, taking the values of newly appended ids
/// from `live`.
fn reconcile_device(
    branch: &mut SettingNode,
    definitions: &BTreeMap<String, SettingMeta>,
    live: Option<&SettingNode>,
) {
    let known: HashSet<String> = branch.branches.iter().map(|b| b.id.clone()).collect();
    branch.reconcile(definitions);

    let Some(live) = live else { return };
    for node in branch.branches.iter_mut().filter(|b| !known.contains(&b.id)) {
        if let Some(current) = live.branch(&node.id) {
            node.value = current.value.clone();
        }
    }
}

impl Engine {
    /// Reshape `tree` to match the devices.
    ///
    /// Root branches that name no device are dropped. Each device gets a stem; within it
    /// existing values are kept, ids the device no longer defines are pruned, and new
    /// ids are added with the device's current value. Calling it twice changes nothing.
    pub fn rebuild_structure(&self, tree: &mut SettingNode) {
        let names: HashSet<String> = self.device_names().into_iter().collect();
        tree.branches.retain(|b| {
            let keep = names.contains(&b.id);
            if !keep {
                debug!(branch = %b.id, "Pruning settings of unknown device");
            }
            keep
        });

        for (name, handle) in self.handles() {
            let (definitions, live) = {
                let device = handle.lock();
                let mut live = SettingNode::stem(name.clone());
                let readable = device.read_settings_bulk(&mut live);
                (
                    device.setting_definitions().clone(),
                    readable.then_some(live),
                )
            };

            let branch = tree.upsert_branch(SettingNode::stem(name.clone()));
            branch.metadata = SettingMeta::new(name.clone(), SettingType::Stem);
            reconcile_device(branch, &definitions, live.as_ref());
        }
    }

    /// Write each device's subtree of `tree`, in device order.
    ///
    /// Stops at the first device that rejects its subtree and reports it as
    /// [`DaqError::SettingsRejected`]. Devices before it, and the part of the rejected
    /// subtree preceding the bad setting, stay applied. Either way the engine tree is
    /// refreshed from the devices.
    pub fn push_settings(&self, tree: &SettingNode) -> AppResult<()> {
        let mut result = Ok(());
        for (name, handle) in self.handles() {
            let Some(subtree) = tree.branch(&name) else {
                continue;
            };
            if let Err(source) = handle.lock().write_settings_bulk(subtree) {
                warn!(device = %name, error = %source, "Device rejected settings");
                result = Err(DaqError::SettingsRejected {
                    device: name,
                    source: Box::new(source),
                });
                break;
            }
            debug!(device = %name, settings = subtree.branches.len(), "Settings pushed");
        }

        for branch in tree.branches.iter().filter(|b| self.device_status(&b.id).is_none()) {
            warn!(branch = %branch.id, "Ignoring settings for unknown device");
        }

        self.pull_settings();
        self.refresh_status();
        result
    }

    /// Read every device into a fresh tree and make it the engine tree.
    ///
    /// Devices that cannot be read contribute an empty stem.
    pub fn pull_settings(&self) -> SettingNode {
        let mut root = SettingNode::stem(SETTINGS_ROOT);
        for (name, handle) in self.handles() {
            let mut node = SettingNode::stem(name.clone());
            if !handle.lock().read_settings_bulk(&mut node) {
                warn!(device = %name, "Settings read failed");
                node = SettingNode::stem(name);
            }
            root.branches.push(node);
        }
        self.state.lock().settings = root.clone();
        root
    }

    /// Copy of the engine tree, without touching the devices.
    pub fn get_all_settings(&self) -> SettingNode {
        self.state.lock().settings.clone()
    }

    /// Refresh the engine tree from the devices. True if every device could be read.
    pub fn read_settings_bulk(&self) -> bool {
        let tree = self.pull_settings();
        tree.branches.iter().all(|b| !b.branches.is_empty())
    }

    /// Push the engine tree to the devices.
    pub fn write_settings_bulk(&self) -> AppResult<()> {
        let tree = self.get_all_settings();
        self.push_settings(&tree)
    }

    /// Set every node matching `address` under `flags` to `address.value` and push.
    ///
    /// Returns how many nodes matched; nothing is pushed when none did.
    pub fn set_setting(&self, address: &SettingNode, flags: MatchFlags) -> AppResult<usize> {
        let mut tree = self.get_all_settings();
        let updated = tree.set_setting(address, flags);
        if updated == 0 {
            debug!(id = %address.id, "No setting matched");
            return Ok(0);
        }
        self.push_settings(&tree)?;
        Ok(updated)
    }

    /// Run the command settings of `device` whose value is 1.
    pub fn execute_command(&self, device: &str) -> AppResult<bool> {
        let handle = self
            .state
            .lock()
            .handle(device)
            .ok_or_else(|| DaqError::UnknownDevice(device.to_string()))?;

        let mut branch = self
            .get_all_settings()
            .branch(device)
            .cloned()
            .unwrap_or_else(|| SettingNode::stem(device));
        let executed = handle.lock().execute_command(&mut branch);
        self.pull_settings();
        Ok(executed)
    }
}
