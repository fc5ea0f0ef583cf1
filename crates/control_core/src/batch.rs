//! Translation of camera assignments into ordered device commands.
//!
//! Every builder emits `[transform, enable, set-content]` for one slot. Nothing
//! here touches the network or shared state.

use serde_json::Value;
use shared::{
    domain::{Camera, ContentKind, SceneName, SlotName},
    protocol::{DeviceCommand, InputSettings, TransformSize},
};

/// A camera whose geometry and url are all present.
#[derive(Debug, Clone, Copy)]
pub struct ValidCamera<'a> {
    camera: &'a Camera,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    url: &'a str,
}

impl<'a> ValidCamera<'a> {
    pub fn new(camera: &'a Camera) -> Option<Self> {
        let url = camera.url.as_deref().filter(|url| !url.is_empty())?;
        Some(Self {
            camera,
            x: camera.x?,
            y: camera.y?,
            width: camera.width?,
            height: camera.height?,
            url,
        })
    }

    pub fn camera(&self) -> &'a Camera {
        self.camera
    }

    pub fn content_kind(&self) -> ContentKind {
        self.camera.kind.content_kind()
    }
}

/// Zero is a legal coordinate; only absent values invalidate a camera.
pub fn is_valid_camera(camera: &Camera) -> bool {
    ValidCamera::new(camera).is_some()
}

fn truncate(value: f64) -> i64 {
    value.trunc() as i64
}

pub fn media_source_commands(
    camera: &ValidCamera<'_>,
    slot: &SlotName,
    scene: &SceneName,
    is_local_file: bool,
) -> Vec<DeviceCommand> {
    let mut settings = InputSettings::new();
    settings.insert("input".into(), Value::from(camera.url));
    settings.insert("is_local_file".into(), Value::from(is_local_file));

    vec![
        DeviceCommand::Transform {
            scene_name: scene.clone(),
            slot_name: slot.clone(),
            position_x: truncate(camera.x),
            position_y: truncate(camera.y),
            size: TransformSize::Width {
                width: truncate(camera.width),
            },
        },
        enable_command(scene, slot, true),
        DeviceCommand::SetContent {
            slot_name: slot.clone(),
            settings,
        },
    ]
}

/// Web slots keep unit scale; the page itself is sized through its settings.
pub fn web_source_commands(
    camera: &ValidCamera<'_>,
    slot: &SlotName,
    scene: &SceneName,
) -> Vec<DeviceCommand> {
    let mut settings = InputSettings::new();
    settings.insert("url".into(), Value::from(camera.url));
    settings.insert("width".into(), Value::from(truncate(camera.width)));
    settings.insert("height".into(), Value::from(truncate(camera.height)));

    vec![
        DeviceCommand::Transform {
            scene_name: scene.clone(),
            slot_name: slot.clone(),
            position_x: truncate(camera.x),
            position_y: truncate(camera.y),
            size: TransformSize::Scale {
                scale_x: 1.0,
                scale_y: 1.0,
            },
        },
        enable_command(scene, slot, true),
        DeviceCommand::SetContent {
            slot_name: slot.clone(),
            settings,
        },
    ]
}

pub fn source_commands(
    camera: &ValidCamera<'_>,
    slot: &SlotName,
    scene: &SceneName,
) -> Vec<DeviceCommand> {
    match camera.content_kind() {
        ContentKind::Media => {
            media_source_commands(camera, slot, scene, camera.camera().kind.is_local_file())
        }
        ContentKind::Web => web_source_commands(camera, slot, scene),
    }
}

pub fn enable_command(scene: &SceneName, slot: &SlotName, enabled: bool) -> DeviceCommand {
    DeviceCommand::Enable {
        scene_name: scene.clone(),
        slot_name: slot.clone(),
        enabled,
    }
}

#[cfg(test)]
#[path = "tests/batch_tests.rs"]
mod tests;
