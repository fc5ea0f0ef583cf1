//! Planning of the command batch that moves the switcher to a requested scene.
//!
//! A scene pass is: optional scene switch, settle pause, one command group per
//! assigned camera, then a disable for every declared slot nobody claimed.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use shared::{
    domain::{Camera, CameraId, ContentKind, LivePreview, PreviewMode, SceneName, SceneRequest, SlotName},
    protocol::DeviceCommand,
};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::{
    batch::{enable_command, source_commands, ValidCamera},
    scene::{SceneCatalog, SceneState},
};

/// Delay after a (possible) scene switch before per-slot commands run.
pub const SETTLE_PAUSE_MS: u64 = 1000;

/// Only the first entries of a scene request are ever considered.
pub const MAX_SCENE_CAMERAS: usize = 2;

/// Why a pass ended without talking to the switcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("request names no target scene or no camera list")]
    IncompleteRequest,
    #[error("current scene is not known yet")]
    UnknownCurrentScene,
    #[error("live preview is off")]
    PreviewOff,
    #[error("camera {0} is not configured")]
    UnknownCamera(CameraId),
    #[error("camera {0} is missing geometry or url")]
    InvalidCamera(CameraId),
    #[error("scene {scene} has no {slot} slot")]
    SlotNotInScene { scene: SceneName, slot: SlotName },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenePlan {
    pub target: SceneName,
    /// `true` when the batch starts with a scene switch; otherwise the pass
    /// bumps the transition pulse instead.
    pub switches_scene: bool,
    pub commands: Vec<DeviceCommand>,
    pub assigned: Vec<(CameraId, SlotName)>,
    pub disabled: Vec<SlotName>,
}

impl ScenePlan {
    pub fn pulses_transition(&self) -> bool {
        !self.switches_scene
    }
}

pub fn plan_scene(
    request: &SceneRequest,
    current_scene: Option<&SceneName>,
    catalog: &SceneCatalog,
    cameras: &[Camera],
) -> Result<ScenePlan, SkipReason> {
    let (Some(target), Some(requested)) = (&request.scene, &request.cameras) else {
        return Err(SkipReason::IncompleteRequest);
    };
    let current = current_scene.ok_or(SkipReason::UnknownCurrentScene)?;

    let mut commands = Vec::new();
    let switches_scene = current != target;
    if switches_scene {
        commands.push(DeviceCommand::SceneSwitch {
            scene_name: target.clone(),
        });
    }
    commands.push(DeviceCommand::Pause {
        duration_ms: SETTLE_PAUSE_MS,
    });

    let declared = catalog.declared_slots(target);
    let mut claimed: HashSet<&SlotName> = HashSet::new();
    let mut positions: HashMap<ContentKind, usize> = HashMap::new();
    let mut assigned = Vec::new();

    for camera_id in requested.iter().take(MAX_SCENE_CAMERAS) {
        let Some(camera) = cameras.iter().find(|c| &c.id == camera_id) else {
            continue;
        };
        let Some(valid) = ValidCamera::new(camera) else {
            continue;
        };

        let kind = valid.content_kind();
        let position = positions.entry(kind).or_insert(0);
        *position += 1;
        let candidate = kind.numbered_slot(*position);

        let Some(slot) = declared.iter().find(|s| **s == candidate) else {
            continue;
        };
        if !claimed.insert(slot) {
            continue;
        }
        commands.extend(source_commands(&valid, slot, target));
        assigned.push((camera.id.clone(), slot.clone()));
    }

    let disabled: Vec<SlotName> = declared
        .iter()
        .filter(|slot| !claimed.contains(slot))
        .cloned()
        .collect();
    commands.extend(disabled.iter().map(|slot| enable_command(target, slot, false)));

    Ok(ScenePlan {
        target: target.clone(),
        switches_scene,
        commands,
        assigned,
        disabled,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreviewPlan {
    pub scene: SceneName,
    pub slot: SlotName,
    pub commands: Vec<DeviceCommand>,
}

/// Single-slot variant: put the live-preview camera into the current scene's
/// unnumbered slot for its kind, without switching or disabling anything.
pub fn plan_preview(
    live_preview: &LivePreview,
    cameras: &[Camera],
    scenes: &SceneState,
) -> Result<PreviewPlan, SkipReason> {
    let camera_id = match (&live_preview.id, live_preview.preview) {
        (Some(id), PreviewMode::On) => id,
        _ => return Err(SkipReason::PreviewOff),
    };
    let camera = cameras
        .iter()
        .find(|c| &c.id == camera_id)
        .ok_or_else(|| SkipReason::UnknownCamera(camera_id.clone()))?;
    let valid =
        ValidCamera::new(camera).ok_or_else(|| SkipReason::InvalidCamera(camera_id.clone()))?;
    let scene = scenes
        .current_scene()
        .ok_or(SkipReason::UnknownCurrentScene)?;

    let slot = valid.content_kind().preview_slot();
    if !scenes.has_slot(scene, &slot) {
        return Err(SkipReason::SlotNotInScene {
            scene: scene.clone(),
            slot,
        });
    }

    Ok(PreviewPlan {
        commands: source_commands(&valid, &slot, scene),
        scene: scene.clone(),
        slot,
    })
}

/// One in-flight pass per scene; later passes for the same scene queue.
#[derive(Default)]
pub struct SceneLocks {
    locks: Mutex<HashMap<SceneName, Arc<tokio::sync::Mutex<()>>>>,
}

impl SceneLocks {
    pub async fn acquire(&self, scene: &SceneName) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(scene.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
