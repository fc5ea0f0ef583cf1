use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

macro_rules! name_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

name_newtype!(SceneName);
name_newtype!(SlotName);
name_newtype!(CameraId);

/// Prefix of slots that display media (stream or file) content.
pub const MEDIA_SLOT_PREFIX: &str = "MEDIA_";
/// Prefix of slots that display web content.
pub const WEB_SLOT_PREFIX: &str = "WEB_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraKind {
    Stream,
    File,
    Web,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Media,
    Web,
}

impl CameraKind {
    pub fn content_kind(self) -> ContentKind {
        match self {
            CameraKind::Stream | CameraKind::File => ContentKind::Media,
            CameraKind::Web => ContentKind::Web,
        }
    }

    pub fn is_local_file(self) -> bool {
        matches!(self, CameraKind::File)
    }
}

impl ContentKind {
    pub fn slot_prefix(self) -> &'static str {
        match self {
            ContentKind::Media => MEDIA_SLOT_PREFIX,
            ContentKind::Web => WEB_SLOT_PREFIX,
        }
    }

    /// Numbered slot for the `position`-th (1-indexed) camera of a scene request.
    pub fn numbered_slot(self, position: usize) -> SlotName {
        SlotName(format!("{}{position}", self.slot_prefix()))
    }

    /// The single unnumbered slot used by live preview, e.g. `MEDIA`.
    pub fn preview_slot(self) -> SlotName {
        SlotName(self.slot_prefix().trim_end_matches('_').to_string())
    }
}

/// A logical source as configured by a control surface.
///
/// Geometry is optional on the wire; a camera missing any of it is kept in
/// the configured list but never reaches the switcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub id: CameraId,
    #[serde(rename = "type")]
    pub kind: CameraKind,
    #[serde(default, deserialize_with = "lenient_number")]
    pub x: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub y: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub width: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub height: Option<f64>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Accepts numbers and numeric strings; anything else reads as absent.
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    let value = match raw {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(value.filter(|v| v.is_finite()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewMode {
    #[default]
    Off,
    On,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LivePreview {
    #[serde(default)]
    pub id: Option<CameraId>,
    #[serde(default)]
    pub preview: PreviewMode,
}

/// A caller-declared target: put `cameras` on air in `scene`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SceneRequest {
    #[serde(default)]
    pub scene: Option<SceneName>,
    #[serde(default)]
    pub cameras: Option<Vec<CameraId>>,
}

impl SceneRequest {
    pub fn new(scene: impl Into<SceneName>, cameras: impl IntoIterator<Item = CameraId>) -> Self {
        Self {
            scene: Some(scene.into()),
            cameras: Some(cameras.into_iter().collect()),
        }
    }

    /// Both a target scene and a camera list are present.
    pub fn is_complete(&self) -> bool {
        self.scene.is_some() && self.cameras.is_some()
    }
}

/// Overlay stage shared between the livestream and timer pages. The control
/// process only stores and relays it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OverlayState {
    #[serde(default)]
    pub requested_stage: Option<String>,
    #[serde(default)]
    pub current_stage: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSceneRequest {
    pub request: SceneRequest,
    pub applied_at: DateTime<Utc>,
}
