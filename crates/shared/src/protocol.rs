use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{
        ActiveSceneRequest, Camera, LivePreview, OverlayState, SceneName, SceneRequest, SlotName,
    },
    error::ApiError,
};

/// Settings object applied to a slot's input, compared key by key by the cache.
pub type InputSettings = serde_json::Map<String, serde_json::Value>;

/// Device-reported item ids, per scene and slot.
pub type SceneInventory = BTreeMap<SceneName, BTreeMap<SlotName, i64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformSize {
    /// Pixel width; height follows the source aspect ratio.
    Width { width: i64 },
    Scale { scale_x: f64, scale_y: f64 },
}

/// One unit of work for the switcher executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceCommand {
    SceneSwitch {
        scene_name: SceneName,
    },
    Pause {
        duration_ms: u64,
    },
    Transform {
        scene_name: SceneName,
        slot_name: SlotName,
        position_x: i64,
        position_y: i64,
        size: TransformSize,
    },
    Enable {
        scene_name: SceneName,
        slot_name: SlotName,
        enabled: bool,
    },
    SetContent {
        slot_name: SlotName,
        settings: InputSettings,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub ok: bool,
    pub code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl CommandResult {
    pub fn success() -> Self {
        Self {
            ok: true,
            code: 100,
            comment: None,
        }
    }

    pub fn failure(code: u32, comment: impl Into<String>) -> Self {
        Self {
            ok: false,
            code,
            comment: Some(comment.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed { results: Vec<CommandResult> },
    Failed { error: ApiError },
}

impl BatchOutcome {
    /// Whether the command at `index` is known to have been applied.
    pub fn command_succeeded(&self, index: usize) -> bool {
        match self {
            BatchOutcome::Completed { results } => results.get(index).is_some_and(|r| r.ok),
            BatchOutcome::Failed { .. } => false,
        }
    }

    pub fn is_fully_successful(&self) -> bool {
        match self {
            BatchOutcome::Completed { results } => results.iter().all(|r| r.ok),
            BatchOutcome::Failed { .. } => false,
        }
    }
}

/// Messages carried by the relay between the control process and the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RelayMessage {
    DispatchBatch {
        correlation_id: CorrelationId,
        commands: Vec<DeviceCommand>,
    },
    BatchResult {
        correlation_id: CorrelationId,
        outcome: BatchOutcome,
    },
    SceneChanged {
        scene_name: SceneName,
    },
    SceneInventory {
        scenes: SceneInventory,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SurfaceRequest {
    SetCameras { cameras: Vec<Camera> },
    SetLivePreview { live_preview: LivePreview },
    RequestScene { request: SceneRequest },
    SetRequestedStage { stage: Option<String> },
    SetCurrentStage { stage: Option<String> },
    SetAvailableCameras { available: Vec<String> },
    /// What the manager page shows as camera previews (e.g. `images`).
    SetPreviewSource { preview: String },
}

/// Full control state as first sent to a newly connected surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlSnapshot {
    pub cameras: Vec<Camera>,
    pub live_preview: LivePreview,
    pub play_transition: u64,
    pub requested_scene: Option<SceneRequest>,
    pub active_scene: Option<ActiveSceneRequest>,
    pub current_scene: Option<SceneName>,
    pub relay_connected: bool,
    pub overlay: OverlayState,
    pub available_cameras: Vec<String>,
    pub preview_source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SurfaceEvent {
    EntireConfig {
        snapshot: ControlSnapshot,
    },
    CamerasUpdated {
        cameras: Vec<Camera>,
    },
    LivePreviewUpdated {
        live_preview: LivePreview,
    },
    SceneRequested {
        request: Option<SceneRequest>,
    },
    SceneChanged {
        scene_name: SceneName,
    },
    ActiveSceneRequestChanged {
        active: ActiveSceneRequest,
    },
    TransitionPulse {
        value: u64,
    },
    RelayStatus {
        connected: bool,
    },
    OverlayUpdated {
        overlay: OverlayState,
    },
    AvailableCamerasUpdated {
        available: Vec<String>,
    },
    PreviewSourceUpdated {
        preview: String,
    },
    Error(ApiError),
}
