use std::collections::{BTreeMap, HashSet};

use shared::{
    domain::{SceneName, SlotName, MEDIA_SLOT_PREFIX, WEB_SLOT_PREFIX},
    protocol::SceneInventory,
};

use crate::{cache::SlotKey, error::CatalogError};

/// Declared, reconcilable slots of every scene, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SceneCatalog {
    scenes: BTreeMap<SceneName, Vec<SlotName>>,
}

impl SceneCatalog {
    pub fn new<I>(scenes: I) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = (SceneName, Vec<SlotName>)>,
    {
        let mut catalog = BTreeMap::new();
        for (scene, slots) in scenes {
            if scene.as_str().trim().is_empty() {
                return Err(CatalogError::EmptySceneName);
            }
            let mut seen = HashSet::new();
            for slot in &slots {
                if slot.as_str().is_empty() {
                    return Err(CatalogError::EmptySlot { scene });
                }
                if !is_conventional_slot(slot) {
                    return Err(CatalogError::UnconventionalSlot {
                        scene,
                        slot: slot.clone(),
                    });
                }
                if !seen.insert(slot) {
                    return Err(CatalogError::DuplicateSlot {
                        scene,
                        slot: slot.clone(),
                    });
                }
            }
            catalog.insert(scene, slots);
        }
        Ok(Self { scenes: catalog })
    }

    /// Empty for scenes without controllable sources or unknown scenes.
    pub fn declared_slots(&self, scene: &SceneName) -> &[SlotName] {
        self.scenes.get(scene).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains_scene(&self, scene: &SceneName) -> bool {
        self.scenes.contains_key(scene)
    }

    /// Declared slots the switcher did not report.
    pub fn missing_on_device(&self, inventory: &SceneInventory) -> Vec<SlotKey> {
        self.scenes
            .iter()
            .flat_map(|(scene, slots)| {
                let reported = inventory.get(scene);
                slots
                    .iter()
                    .filter(move |slot| !reported.is_some_and(|items| items.contains_key(*slot)))
                    .map(move |slot| SlotKey::new(scene, slot))
            })
            .collect()
    }
}

fn is_conventional_slot(slot: &SlotName) -> bool {
    [MEDIA_SLOT_PREFIX, WEB_SLOT_PREFIX].iter().any(|prefix| {
        slot.as_str()
            .strip_prefix(prefix)
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    })
}

/// What the switcher currently shows, as last reported.
#[derive(Debug, Clone, Default)]
pub struct SceneState {
    current_scene: Option<SceneName>,
    slot_ids: SceneInventory,
}

impl SceneState {
    pub fn current_scene(&self) -> Option<&SceneName> {
        self.current_scene.as_ref()
    }

    /// Returns `false` when the scene was already current.
    pub fn set_current_scene(&mut self, scene: SceneName) -> bool {
        if self.current_scene.as_ref() == Some(&scene) {
            return false;
        }
        self.current_scene = Some(scene);
        true
    }

    pub fn set_inventory(&mut self, inventory: SceneInventory) {
        self.slot_ids = inventory;
    }

    pub fn slot_id(&self, scene: &SceneName, slot: &SlotName) -> Option<i64> {
        self.slot_ids.get(scene)?.get(slot).copied()
    }

    pub fn has_slot(&self, scene: &SceneName, slot: &SlotName) -> bool {
        self.slot_id(scene, slot).is_some()
    }
}
