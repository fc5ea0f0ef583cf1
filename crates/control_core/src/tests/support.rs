use shared::domain::{Camera, CameraId, CameraKind};

pub(crate) fn camera(id: &str, kind: CameraKind, url: &str) -> Camera {
    Camera {
        id: CameraId::from(id),
        kind,
        x: Some(10.9),
        y: Some(20.2),
        width: Some(640.6),
        height: Some(360.4),
        url: Some(url.to_string()),
    }
}

pub(crate) fn web_camera(id: &str) -> Camera {
    camera(id, CameraKind::Web, "https://scores.example/overlay")
}

pub(crate) fn media_camera(id: &str) -> Camera {
    camera(id, CameraKind::Stream, "rtmp://cams.example/live/1")
}
