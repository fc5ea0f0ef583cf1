//! Last-known input settings per (scene, slot), used to drop set-content
//! commands that would not change anything on the switcher.

use std::collections::HashMap;

use shared::{
    domain::{SceneName, SlotName},
    protocol::{BatchOutcome, DeviceCommand, InputSettings},
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub scene: SceneName,
    pub slot: SlotName,
}

impl SlotKey {
    pub fn new(scene: &SceneName, slot: &SlotName) -> Self {
        Self {
            scene: scene.clone(),
            slot: slot.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SettingsCache {
    entries: HashMap<SlotKey, InputSettings>,
}

impl SettingsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, scene: &SceneName, slot: &SlotName) -> Option<&InputSettings> {
        self.entries.get(&SlotKey::new(scene, slot))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merges `settings` into the entry, creating it if needed.
    pub fn record(&mut self, scene: &SceneName, slot: &SlotName, settings: &InputSettings) {
        let entry = self.entries.entry(SlotKey::new(scene, slot)).or_default();
        for (key, value) in settings {
            entry.insert(key.clone(), value.clone());
        }
    }

    pub fn invalidate(&mut self, scene: &SceneName, slot: &SlotName) -> bool {
        self.entries.remove(&SlotKey::new(scene, slot)).is_some()
    }

    /// Drops set-content commands whose every key already matches the cache.
    ///
    /// Kept commands advance the cache to their values before the switcher has
    /// confirmed them. Scene switches inside the batch move the scene that
    /// later set-content commands are looked up under.
    pub fn filter_redundant(
        &mut self,
        batch: Vec<DeviceCommand>,
        current_scene: &SceneName,
    ) -> Vec<DeviceCommand> {
        let mut scene = current_scene.clone();
        let mut filtered = Vec::with_capacity(batch.len());

        for command in batch {
            match &command {
                DeviceCommand::SceneSwitch { scene_name } => scene = scene_name.clone(),
                DeviceCommand::SetContent {
                    slot_name,
                    settings,
                } => {
                    let key = SlotKey::new(&scene, slot_name);
                    if let Some(cached) = self.entries.get_mut(&key) {
                        let changed: Vec<_> = settings
                            .iter()
                            .filter(|(k, v)| cached.get(k.as_str()) != Some(*v))
                            .collect();
                        if changed.is_empty() {
                            debug!(scene = %scene, slot = %slot_name, "dropping redundant set-content");
                            continue;
                        }
                        for (k, v) in changed {
                            cached.insert(k.clone(), v.clone());
                        }
                    }
                }
                _ => {}
            }
            filtered.push(command);
        }

        filtered
    }

    /// Reconciles the cache with what the switcher reported for `batch`.
    ///
    /// Applied set-content commands are recorded; those that failed or never
    /// got an answer (`outcome == None`) are invalidated so the next identical
    /// request is sent again.
    pub fn settle(
        &mut self,
        batch: &[DeviceCommand],
        current_scene: &SceneName,
        outcome: Option<&BatchOutcome>,
    ) {
        let mut scene = current_scene.clone();
        for (index, command) in batch.iter().enumerate() {
            match command {
                DeviceCommand::SceneSwitch { scene_name } => scene = scene_name.clone(),
                DeviceCommand::SetContent {
                    slot_name,
                    settings,
                } => {
                    if outcome.is_some_and(|o| o.command_succeeded(index)) {
                        self.record(&scene, slot_name, settings);
                    } else {
                        self.invalidate(&scene, slot_name);
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
