use super::*;
use axum::{body, body::Body, http::Request, http::StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Camera, CameraId, CameraKind, SceneName, SceneRequest},
    protocol::{BatchOutcome, CommandResult},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_state() -> Arc<AppState> {
    let settings = config::Settings::default();
    Arc::new(AppState::new(ControlConfig {
        catalog: settings.catalog().expect("catalog"),
        batch_timeout: Duration::from_secs(5),
    }))
}

async fn spawn_server() -> (SocketAddr, Arc<AppState>) {
    let state = test_state();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = build_router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, state)
}

async fn next_frame(ws: &mut Client) -> Option<WsMessage> {
    tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timely frame")
        .map(|frame| frame.expect("frame"))
}

async fn next_json<T: DeserializeOwned>(ws: &mut Client) -> T {
    loop {
        if let Some(WsMessage::Text(text)) = next_frame(ws).await {
            return serde_json::from_str(&text).expect("json");
        }
    }
}

async fn wait_for(ws: &mut Client, matches: impl Fn(&SurfaceEvent) -> bool) -> SurfaceEvent {
    loop {
        let event: SurfaceEvent = next_json(ws).await;
        if matches(&event) {
            return event;
        }
    }
}

async fn send_json_frame<T: serde::Serialize>(ws: &mut Client, value: &T) {
    let text = serde_json::to_string(value).expect("encode");
    ws.send(WsMessage::Text(text)).await.expect("send");
}

fn camera(id: &str) -> Camera {
    Camera {
        id: CameraId::from(id),
        kind: CameraKind::Stream,
        x: Some(0.0),
        y: Some(0.0),
        width: Some(1280.0),
        height: Some(720.0),
        url: Some("rtmp://cams.example/live/a".into()),
    }
}

#[tokio::test]
async fn healthz_reports_ok() {
    let app = build_router(test_state());
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn state_route_returns_snapshot() {
    let app = build_router(test_state());
    let request = Request::get("/state").body(Body::empty()).expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let snapshot: ControlSnapshot = serde_json::from_slice(&body).expect("json");
    assert!(!snapshot.relay_connected);
    assert_eq!(snapshot.current_scene, None);
    assert_eq!(snapshot.play_transition, 0);
}

#[tokio::test]
async fn surface_request_round_trips_through_agent() {
    let (addr, state) = spawn_server().await;

    let (mut surface, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("surface connect");
    let first: SurfaceEvent = next_json(&mut surface).await;
    assert!(matches!(first, SurfaceEvent::EntireConfig { .. }));

    let (mut agent, _) = connect_async(format!("ws://{addr}/relay"))
        .await
        .expect("agent connect");
    wait_for(&mut surface, |e| {
        matches!(e, SurfaceEvent::RelayStatus { connected: true })
    })
    .await;

    send_json_frame(
        &mut agent,
        &RelayMessage::SceneChanged {
            scene_name: SceneName::from("TwoCamera"),
        },
    )
    .await;
    wait_for(&mut surface, |e| matches!(e, SurfaceEvent::SceneChanged { .. })).await;

    send_json_frame(
        &mut surface,
        &SurfaceRequest::SetCameras {
            cameras: vec![camera("cam-a")],
        },
    )
    .await;
    wait_for(&mut surface, |e| matches!(e, SurfaceEvent::CamerasUpdated { .. })).await;

    send_json_frame(
        &mut surface,
        &SurfaceRequest::RequestScene {
            request: SceneRequest::new("TwoCamera", [CameraId::from("cam-a")]),
        },
    )
    .await;

    let RelayMessage::DispatchBatch {
        correlation_id,
        commands,
    } = next_json(&mut agent).await
    else {
        panic!("expected dispatch_batch");
    };
    let results = commands.iter().map(|_| CommandResult::success()).collect();
    send_json_frame(
        &mut agent,
        &RelayMessage::BatchResult {
            correlation_id,
            outcome: BatchOutcome::Completed { results },
        },
    )
    .await;

    wait_for(&mut surface, |e| {
        matches!(e, SurfaceEvent::ActiveSceneRequestChanged { .. })
    })
    .await;
    let snapshot = state.control.snapshot().await;
    assert!(snapshot.active_scene.is_some());
    assert_eq!(snapshot.requested_scene, None);
    assert_eq!(state.control.pending_batches(), 0);
}

#[tokio::test]
async fn malformed_surface_request_gets_validation_error() {
    let (addr, _state) = spawn_server().await;
    let (mut surface, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("surface connect");
    let _: SurfaceEvent = next_json(&mut surface).await;

    surface
        .send(WsMessage::Text("{\"type\":\"launch_rockets\"}".into()))
        .await
        .expect("send");
    let event = wait_for(&mut surface, |e| matches!(e, SurfaceEvent::Error(_))).await;
    let SurfaceEvent::Error(error) = event else {
        unreachable!();
    };
    assert_eq!(error.code, ErrorCode::Validation);
}

#[tokio::test]
async fn newer_agent_replaces_older() {
    let (addr, state) = spawn_server().await;
    let (mut first, _) = connect_async(format!("ws://{addr}/relay"))
        .await
        .expect("first agent");
    // Make sure the first attachment is registered before the second arrives.
    send_json_frame(
        &mut first,
        &RelayMessage::SceneChanged {
            scene_name: SceneName::from("Present"),
        },
    )
    .await;
    for _ in 0..50 {
        if state.control.current_scene().await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let (_second, _) = connect_async(format!("ws://{addr}/relay"))
        .await
        .expect("second agent");

    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), first.next())
            .await
            .expect("replaced agent should be closed");
        match frame {
            None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
            Some(Ok(_)) => continue,
        }
    }
    assert!(state.relay.is_connected());
}
