use std::sync::Mutex as StdMutex;

use super::*;
use crate::{
    relay::RelayHub,
    tests_support::{media_camera, web_camera},
};
use shared::{
    domain::{CameraId, SlotName},
    protocol::CommandResult,
};
use tokio::{sync::mpsc, task::JoinHandle};

type SentBatches = Arc<StdMutex<Vec<Vec<DeviceCommand>>>>;

fn catalog() -> SceneCatalog {
    SceneCatalog::new([
        (
            SceneName::from("TwoCamera"),
            ["MEDIA_1", "MEDIA_2", "WEB_1", "WEB_2"]
                .into_iter()
                .map(SlotName::from)
                .collect(),
        ),
        (SceneName::from("Present"), Vec::new()),
    ])
    .expect("catalog")
}

fn inventory() -> SceneInventory {
    let mut inventory = SceneInventory::new();
    let present = inventory.entry(SceneName::from("Present")).or_default();
    present.insert(SlotName::from("MEDIA"), 3);
    present.insert(SlotName::from("WEB"), 4);
    let two = inventory.entry(SceneName::from("TwoCamera")).or_default();
    for (id, slot) in ["MEDIA_1", "MEDIA_2", "WEB_1", "WEB_2"].into_iter().enumerate() {
        two.insert(SlotName::from(slot), id as i64 + 10);
    }
    inventory
}

async fn control_on(scene: &str, batch_timeout: Duration) -> (Arc<ControlPlane>, Arc<RelayHub>) {
    let hub = Arc::new(RelayHub::new());
    let control = ControlPlane::new(
        ControlConfig {
            catalog: catalog(),
            batch_timeout,
        },
        hub.clone(),
    );
    control
        .handle_relay_message(RelayMessage::SceneChanged {
            scene_name: SceneName::from(scene),
        })
        .await;
    control
        .handle_relay_message(RelayMessage::SceneInventory {
            scenes: inventory(),
        })
        .await;
    (control, hub)
}

/// Attaches a fake agent that answers every batch with all-success results.
fn spawn_agent(control: &Arc<ControlPlane>, hub: &RelayHub) -> (SentBatches, JoinHandle<()>) {
    spawn_failing_agent(control, hub, |_, _| false)
}

/// Like `spawn_agent`, but reports failure for every command `fails` picks.
fn spawn_failing_agent(
    control: &Arc<ControlPlane>,
    hub: &RelayHub,
    fails: fn(usize, &DeviceCommand) -> bool,
) -> (SentBatches, JoinHandle<()>) {
    let (_, mut outbound) = hub.attach();
    let sent: SentBatches = Arc::default();
    let control = Arc::clone(control);
    let seen = Arc::clone(&sent);
    let task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let RelayMessage::DispatchBatch {
                correlation_id,
                commands,
            } = message
            else {
                continue;
            };
            let results = commands
                .iter()
                .enumerate()
                .map(|(index, command)| {
                    if fails(index, command) {
                        CommandResult::failure(600, "no such source")
                    } else {
                        CommandResult::success()
                    }
                })
                .collect();
            seen.lock().unwrap().push(commands);
            control
                .handle_relay_message(RelayMessage::BatchResult {
                    correlation_id,
                    outcome: BatchOutcome::Completed { results },
                })
                .await;
        }
    });
    (sent, task)
}

fn drain(events: &mut broadcast::Receiver<SurfaceEvent>) -> Vec<SurfaceEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn preview_on(id: &str) -> LivePreview {
    LivePreview {
        id: Some(CameraId::from(id)),
        preview: PreviewMode::On,
    }
}

fn has_set_content(commands: &[DeviceCommand]) -> bool {
    commands
        .iter()
        .any(|c| matches!(c, DeviceCommand::SetContent { .. }))
}

#[tokio::test]
async fn repeated_preview_skips_unchanged_content() {
    let (control, hub) = control_on("Present", Duration::from_secs(2)).await;
    let (sent, _agent) = spawn_agent(&control, &hub);
    assert!(control.set_cameras(vec![media_camera("cam")]).await.is_none());

    let ReconcileOutcome::Completed { commands, .. } =
        control.set_live_preview(preview_on("cam")).await
    else {
        panic!("first preview should complete");
    };
    assert!(has_set_content(&commands));

    let ReconcileOutcome::Completed { commands, outcome, .. } =
        control.set_live_preview(preview_on("cam")).await
    else {
        panic!("second preview should complete");
    };
    assert!(!has_set_content(&commands));
    assert_eq!(commands.len(), 2);
    assert!(outcome.is_fully_successful());
    assert_eq!(sent.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn same_scene_request_pulses_transition_and_becomes_active() {
    let (control, hub) = control_on("TwoCamera", Duration::from_secs(2)).await;
    let (_sent, _agent) = spawn_agent(&control, &hub);
    control
        .set_cameras(vec![web_camera("web"), media_camera("media")])
        .await;
    let mut events = control.subscribe();

    let request = SceneRequest::new("TwoCamera", [CameraId::from("web"), CameraId::from("media")]);
    let ReconcileOutcome::Completed { commands, .. } = control.request_scene(request.clone()).await
    else {
        panic!("scene pass should complete");
    };
    assert!(matches!(commands[0], DeviceCommand::Pause { .. }));

    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, SurfaceEvent::TransitionPulse { value: 1 })));
    assert!(events.iter().any(
        |e| matches!(e, SurfaceEvent::ActiveSceneRequestChanged { active } if active.request == request)
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, SurfaceEvent::SceneRequested { request: None })));

    let snapshot = control.snapshot().await;
    assert_eq!(snapshot.play_transition, 1);
    assert_eq!(snapshot.requested_scene, None);
    assert_eq!(snapshot.active_scene.map(|a| a.request), Some(request));
}

#[tokio::test]
async fn switching_scene_updates_current_scene_without_pulse() {
    let (control, hub) = control_on("Present", Duration::from_secs(2)).await;
    let (_sent, _agent) = spawn_agent(&control, &hub);
    control.set_cameras(vec![media_camera("media")]).await;
    let mut events = control.subscribe();

    let outcome = control
        .request_scene(SceneRequest::new("TwoCamera", [CameraId::from("media")]))
        .await;
    let ReconcileOutcome::Completed { commands, .. } = outcome else {
        panic!("scene pass should complete");
    };
    assert!(matches!(
        &commands[0],
        DeviceCommand::SceneSwitch { scene_name } if scene_name.as_str() == "TwoCamera"
    ));

    assert_eq!(control.current_scene().await, Some(SceneName::from("TwoCamera")));
    let events = drain(&mut events);
    assert!(!events
        .iter()
        .any(|e| matches!(e, SurfaceEvent::TransitionPulse { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, SurfaceEvent::SceneChanged { scene_name } if scene_name.as_str() == "TwoCamera")));
    assert_eq!(control.snapshot().await.play_transition, 0);
}

#[tokio::test]
async fn missing_agent_leaves_state_untouched() {
    let (control, _hub) = control_on("TwoCamera", Duration::from_secs(2)).await;
    control.set_cameras(vec![media_camera("media")]).await;

    let request = SceneRequest::new("TwoCamera", [CameraId::from("media")]);
    let outcome = control.request_scene(request.clone()).await;
    assert!(matches!(outcome, ReconcileOutcome::NotDispatched(_)));
    assert_eq!(
        outcome.surface_error().map(|e| e.code),
        Some(ErrorCode::Unavailable)
    );

    let snapshot = control.snapshot().await;
    assert_eq!(snapshot.play_transition, 0);
    assert_eq!(snapshot.active_scene, None);
    assert_eq!(snapshot.requested_scene, Some(request));
    assert_eq!(control.pending_batches(), 0);
}

#[tokio::test]
async fn unanswered_preview_is_resent_once_agent_answers() {
    let (control, hub) = control_on("Present", Duration::from_millis(20)).await;
    let (_, _silent): (u64, mpsc::UnboundedReceiver<RelayMessage>) = hub.attach();
    control.set_cameras(vec![web_camera("web")]).await;

    let outcome = control.set_live_preview(preview_on("web")).await;
    assert!(matches!(
        outcome,
        ReconcileOutcome::Unanswered(CorrelationError::TimedOut(_))
    ));
    assert_eq!(control.pending_batches(), 0);

    let (_sent, _agent) = spawn_agent(&control, &hub);
    let ReconcileOutcome::Completed { commands, .. } = control.apply_live_preview().await else {
        panic!("preview should complete");
    };
    assert!(has_set_content(&commands));
}

#[tokio::test]
async fn removing_preview_camera_clears_selection() {
    let (control, hub) = control_on("Present", Duration::from_secs(2)).await;
    let (_sent, _agent) = spawn_agent(&control, &hub);
    control.set_cameras(vec![media_camera("cam")]).await;
    control.set_live_preview(preview_on("cam")).await;
    let mut events = control.subscribe();

    assert!(control.set_cameras(Vec::new()).await.is_none());

    let snapshot = control.snapshot().await;
    assert_eq!(snapshot.live_preview.id, None);
    assert_eq!(snapshot.live_preview.preview, PreviewMode::On);
    assert!(drain(&mut events).iter().any(
        |e| matches!(e, SurfaceEvent::LivePreviewUpdated { live_preview } if live_preview.id.is_none())
    ));
}

#[tokio::test]
async fn incomplete_request_is_skipped_silently() {
    let (control, _hub) = control_on("TwoCamera", Duration::from_secs(2)).await;
    let mut events = control.subscribe();

    let request = SceneRequest {
        scene: None,
        cameras: Some(vec![CameraId::from("media")]),
    };
    let outcome = control.reconcile_scene(request.clone()).await;
    assert!(matches!(
        outcome,
        ReconcileOutcome::Skipped(SkipReason::IncompleteRequest)
    ));
    assert!(outcome.surface_error().is_none());

    let outcome = control.request_scene(request).await;
    assert!(matches!(
        outcome,
        ReconcileOutcome::Skipped(SkipReason::IncompleteRequest)
    ));
    assert!(drain(&mut events).is_empty());
    assert_eq!(control.snapshot().await.requested_scene, None);
}

#[tokio::test]
async fn relay_status_is_broadcast() {
    let (control, _hub) = control_on("Present", Duration::from_secs(2)).await;
    let mut events = control.subscribe();

    control.set_relay_connected(true).await;
    assert!(control.snapshot().await.relay_connected);
    assert!(matches!(
        events.try_recv(),
        Ok(SurfaceEvent::RelayStatus { connected: true })
    ));
}

#[tokio::test]
async fn partly_failed_switch_keeps_scene_and_drops_failed_cache_entry() {
    let (control, hub) = control_on("Present", Duration::from_secs(2)).await;
    let (_sent, _agent) = spawn_failing_agent(&control, &hub, |index, command| {
        index == 0
            || matches!(
                command,
                DeviceCommand::SetContent { slot_name, .. } if slot_name.as_str() == "MEDIA_1"
            )
    });
    control
        .set_cameras(vec![media_camera("media"), web_camera("web")])
        .await;

    let request = SceneRequest::new("TwoCamera", [CameraId::from("media"), CameraId::from("web")]);
    let outcome = control.request_scene(request.clone()).await;
    let ReconcileOutcome::Completed { commands, .. } = &outcome else {
        panic!("scene pass should complete");
    };
    assert!(matches!(commands[0], DeviceCommand::SceneSwitch { .. }));
    assert_eq!(
        outcome.surface_error().map(|e| e.code),
        Some(ErrorCode::Device)
    );

    assert_eq!(control.current_scene().await, Some(SceneName::from("Present")));
    let two_camera = SceneName::from("TwoCamera");
    {
        let cache = control.cache.lock().await;
        assert!(cache.get(&two_camera, &SlotName::from("MEDIA_1")).is_none());
        assert!(cache.get(&two_camera, &SlotName::from("WEB_1")).is_some());
    }

    // The batch came back, so the request still counts as applied.
    let snapshot = control.snapshot().await;
    assert_eq!(snapshot.active_scene.map(|a| a.request), Some(request));
    assert_eq!(snapshot.requested_scene, None);
    assert_eq!(snapshot.play_transition, 0);
}

#[tokio::test]
async fn preview_waiting_on_a_scene_pass_follows_the_scene_change() {
    let (control, hub) = control_on("Present", Duration::from_secs(2)).await;
    let (sent, _agent) = spawn_agent(&control, &hub);
    control.set_cameras(vec![media_camera("cam")]).await;

    let held = control.scene_locks.acquire(&SceneName::from("Present")).await;
    let preview = tokio::spawn({
        let control = Arc::clone(&control);
        async move { control.set_live_preview(preview_on("cam")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    control
        .handle_relay_message(RelayMessage::SceneChanged {
            scene_name: SceneName::from("TwoCamera"),
        })
        .await;
    drop(held);

    let outcome = preview.await.expect("join");
    assert!(matches!(
        outcome,
        ReconcileOutcome::Skipped(SkipReason::SlotNotInScene { ref scene, .. })
            if scene.as_str() == "TwoCamera"
    ));
    assert!(sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn overlay_and_camera_fields_are_stored_and_broadcast() {
    let (control, _hub) = control_on("Present", Duration::from_secs(2)).await;
    let snapshot = control.snapshot().await;
    assert_eq!(snapshot.available_cameras, vec!["Livestream".to_string()]);
    assert_eq!(snapshot.preview_source, "images");

    let mut events = control.subscribe();
    let requests = [
        SurfaceRequest::SetRequestedStage {
            stage: Some("finals".to_string()),
        },
        SurfaceRequest::SetCurrentStage {
            stage: Some("semis".to_string()),
        },
        SurfaceRequest::SetAvailableCameras {
            available: vec!["Livestream".to_string(), "Pit".to_string()],
        },
        SurfaceRequest::SetPreviewSource {
            preview: "live".to_string(),
        },
    ];
    for request in requests {
        assert!(control.handle_surface_request(request).await.is_none());
    }

    let snapshot = control.snapshot().await;
    assert_eq!(snapshot.overlay.requested_stage.as_deref(), Some("finals"));
    assert_eq!(snapshot.overlay.current_stage.as_deref(), Some("semis"));
    assert_eq!(snapshot.available_cameras.len(), 2);
    assert_eq!(snapshot.preview_source, "live");

    let events = drain(&mut events);
    assert_eq!(events.len(), 4);
    assert!(matches!(
        &events[1],
        SurfaceEvent::OverlayUpdated { overlay }
            if overlay.requested_stage.as_deref() == Some("finals")
                && overlay.current_stage.as_deref() == Some("semis")
    ));
    assert!(matches!(&events[3], SurfaceEvent::PreviewSourceUpdated { preview } if preview == "live"));
}
