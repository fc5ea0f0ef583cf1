use std::{sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::{
        ActiveSceneRequest, Camera, LivePreview, OverlayState, PreviewMode, SceneName,
        SceneRequest,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        BatchOutcome, ControlSnapshot, CorrelationId, DeviceCommand, RelayMessage, SceneInventory,
        SurfaceEvent, SurfaceRequest,
    },
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    cache::SettingsCache,
    correlator::Correlator,
    error::{CorrelationError, DispatchError},
    reconciler::{plan_preview, plan_scene, SceneLocks, SkipReason},
    relay::RelayTransport,
    scene::{SceneCatalog, SceneState},
};

const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub catalog: SceneCatalog,
    pub batch_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            catalog: SceneCatalog::default(),
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
        }
    }
}

/// How one scene or preview pass ended.
#[derive(Debug)]
pub enum ReconcileOutcome {
    Skipped(SkipReason),
    NotDispatched(DispatchError),
    Unanswered(CorrelationError),
    Completed {
        correlation_id: CorrelationId,
        /// The batch as sent, after redundant commands were dropped.
        commands: Vec<DeviceCommand>,
        outcome: BatchOutcome,
    },
}

impl ReconcileOutcome {
    /// Error worth showing to the surface that asked; validation skips stay silent.
    pub fn surface_error(&self) -> Option<ApiError> {
        match self {
            ReconcileOutcome::Skipped(_) => None,
            ReconcileOutcome::NotDispatched(err) => Some(err.into()),
            ReconcileOutcome::Unanswered(err) => Some(err.into()),
            ReconcileOutcome::Completed { outcome, .. } => match outcome {
                BatchOutcome::Failed { error } => Some(error.clone()),
                BatchOutcome::Completed { results } => {
                    let failed = results.iter().filter(|r| !r.ok).count();
                    (failed > 0).then(|| {
                        ApiError::new(
                            ErrorCode::Device,
                            format!("{failed} of {} switcher commands failed", results.len()),
                        )
                    })
                }
            },
        }
    }
}

struct ControlState {
    cameras: Vec<Camera>,
    live_preview: LivePreview,
    play_transition: u64,
    requested_scene: Option<SceneRequest>,
    active_scene: Option<ActiveSceneRequest>,
    relay_connected: bool,
    overlay: OverlayState,
    available_cameras: Vec<String>,
    preview_source: String,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            live_preview: LivePreview::default(),
            play_transition: 0,
            requested_scene: None,
            active_scene: None,
            relay_connected: false,
            overlay: OverlayState::default(),
            available_cameras: vec!["Livestream".to_string()],
            preview_source: "images".to_string(),
        }
    }
}

/// Owns the long-lived control state and drives the switcher through the relay.
pub struct ControlPlane {
    catalog: SceneCatalog,
    batch_timeout: Duration,
    correlator: Correlator,
    state: Mutex<ControlState>,
    cache: Mutex<SettingsCache>,
    scenes: RwLock<SceneState>,
    scene_locks: SceneLocks,
    events: broadcast::Sender<SurfaceEvent>,
}

impl ControlPlane {
    pub fn new(config: ControlConfig, transport: Arc<dyn RelayTransport>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            catalog: config.catalog,
            batch_timeout: config.batch_timeout,
            correlator: Correlator::new(transport),
            state: Mutex::new(ControlState::default()),
            cache: Mutex::new(SettingsCache::new()),
            scenes: RwLock::new(SceneState::default()),
            scene_locks: SceneLocks::default(),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SurfaceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SurfaceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub async fn snapshot(&self) -> ControlSnapshot {
        let current_scene = self.current_scene().await;
        let state = self.state.lock().await;
        ControlSnapshot {
            cameras: state.cameras.clone(),
            live_preview: state.live_preview.clone(),
            play_transition: state.play_transition,
            requested_scene: state.requested_scene.clone(),
            active_scene: state.active_scene.clone(),
            current_scene,
            relay_connected: state.relay_connected,
            overlay: state.overlay.clone(),
            available_cameras: state.available_cameras.clone(),
            preview_source: state.preview_source.clone(),
        }
    }

    pub async fn current_scene(&self) -> Option<SceneName> {
        self.scenes.read().await.current_scene().cloned()
    }

    pub fn pending_batches(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Applies a control-surface mutation, re-broadcasts it and runs the
    /// matching reaction. `None` when the mutation needed no switcher work.
    pub async fn handle_surface_request(
        &self,
        request: SurfaceRequest,
    ) -> Option<ReconcileOutcome> {
        match request {
            SurfaceRequest::SetCameras { cameras } => self.set_cameras(cameras).await,
            SurfaceRequest::SetLivePreview { live_preview } => {
                Some(self.set_live_preview(live_preview).await)
            }
            SurfaceRequest::RequestScene { request } => Some(self.request_scene(request).await),
            SurfaceRequest::SetRequestedStage { stage } => {
                self.update_overlay(|overlay| overlay.requested_stage = stage)
                    .await;
                None
            }
            SurfaceRequest::SetCurrentStage { stage } => {
                self.update_overlay(|overlay| overlay.current_stage = stage)
                    .await;
                None
            }
            SurfaceRequest::SetAvailableCameras { available } => {
                self.state.lock().await.available_cameras = available.clone();
                self.emit(SurfaceEvent::AvailableCamerasUpdated { available });
                None
            }
            SurfaceRequest::SetPreviewSource { preview } => {
                self.state.lock().await.preview_source = preview.clone();
                self.emit(SurfaceEvent::PreviewSourceUpdated { preview });
                None
            }
        }
    }

    async fn update_overlay(&self, change: impl FnOnce(&mut OverlayState)) {
        let overlay = {
            let mut state = self.state.lock().await;
            change(&mut state.overlay);
            state.overlay.clone()
        };
        self.emit(SurfaceEvent::OverlayUpdated { overlay });
    }

    /// Replaces the configured cameras. A live preview whose camera vanished
    /// is switched off; otherwise it is re-applied with the new data.
    pub async fn set_cameras(&self, cameras: Vec<Camera>) -> Option<ReconcileOutcome> {
        // `Some(still_configured)` while a preview is showing.
        let (selected, live_preview) = {
            let mut state = self.state.lock().await;
            state.cameras = cameras.clone();
            let selected = match (&state.live_preview.id, state.live_preview.preview) {
                (Some(id), PreviewMode::On) => Some(state.cameras.iter().any(|c| &c.id == id)),
                _ => None,
            };
            if selected == Some(false) {
                state.live_preview.id = None;
            }
            (selected, state.live_preview.clone())
        };
        self.emit(SurfaceEvent::CamerasUpdated { cameras });

        match selected {
            Some(false) => {
                info!("live preview camera removed; clearing selection");
                self.emit(SurfaceEvent::LivePreviewUpdated { live_preview });
                None
            }
            Some(true) => Some(self.apply_live_preview().await),
            None => None,
        }
    }

    pub async fn set_live_preview(&self, live_preview: LivePreview) -> ReconcileOutcome {
        self.state.lock().await.live_preview = live_preview.clone();
        self.emit(SurfaceEvent::LivePreviewUpdated { live_preview });
        self.apply_live_preview().await
    }

    /// Records `request` as pending and reconciles it. Incomplete requests
    /// are dropped before they become pending.
    pub async fn request_scene(&self, request: SceneRequest) -> ReconcileOutcome {
        if !request.is_complete() {
            return skipped(SkipReason::IncompleteRequest);
        }
        self.state.lock().await.requested_scene = Some(request.clone());
        self.emit(SurfaceEvent::SceneRequested {
            request: Some(request.clone()),
        });
        self.reconcile_scene(request).await
    }

    /// Moves the switcher to `request`, holding the scene's single-flight
    /// lock for the whole pass.
    pub async fn reconcile_scene(&self, request: SceneRequest) -> ReconcileOutcome {
        let Some(target) = request.scene.clone().filter(|_| request.is_complete()) else {
            return skipped(SkipReason::IncompleteRequest);
        };
        let _pass = self.scene_locks.acquire(&target).await;

        let Some(current) = self.current_scene().await else {
            return skipped(SkipReason::UnknownCurrentScene);
        };
        let cameras = self.state.lock().await.cameras.clone();
        let plan = match plan_scene(&request, Some(&current), &self.catalog, &cameras) {
            Ok(plan) => plan,
            Err(reason) => return skipped(reason),
        };
        info!(
            scene = %plan.target,
            switches_scene = plan.switches_scene,
            assigned = plan.assigned.len(),
            disabled = plan.disabled.len(),
            "reconcile: dispatching scene pass"
        );

        let pulse = plan.pulses_transition();
        let result = self.ship(plan.commands, &current, pulse).await;

        if let ReconcileOutcome::Completed { outcome, .. } = &result {
            if plan.switches_scene && outcome.command_succeeded(0) {
                self.note_current_scene(plan.target).await;
            }
            if matches!(outcome, BatchOutcome::Completed { .. }) {
                self.mark_active(request).await;
            }
        }
        result
    }

    /// Pushes the live-preview camera into the current scene's preview slot.
    pub async fn apply_live_preview(&self) -> ReconcileOutcome {
        loop {
            let (live_preview, cameras) = {
                let state = self.state.lock().await;
                (state.live_preview.clone(), state.cameras.clone())
            };
            let plan = {
                let scenes = self.scenes.read().await;
                match plan_preview(&live_preview, &cameras, &scenes) {
                    Ok(plan) => plan,
                    Err(reason) => return skipped(reason),
                }
            };
            let _pass = self.scene_locks.acquire(&plan.scene).await;
            // The scene may have moved while we queued behind another pass.
            if self.current_scene().await.as_ref() != Some(&plan.scene) {
                debug!(scene = %plan.scene, "preview: scene changed while waiting; replanning");
                continue;
            }
            debug!(scene = %plan.scene, slot = %plan.slot, "preview: dispatching");
            return self.ship(plan.commands, &plan.scene, false).await;
        }
    }

    /// Filters, dispatches and awaits one batch, then settles the cache
    /// against whatever came back.
    async fn ship(
        &self,
        candidate: Vec<DeviceCommand>,
        scene: &SceneName,
        pulse: bool,
    ) -> ReconcileOutcome {
        let commands = self.cache.lock().await.filter_redundant(candidate, scene);
        let pending = match self.correlator.dispatch(commands.clone()) {
            Ok(pending) => pending,
            Err(err) => {
                self.cache.lock().await.settle(&commands, scene, None);
                return ReconcileOutcome::NotDispatched(err);
            }
        };
        if pulse {
            self.bump_transition().await;
        }

        let correlation_id = pending.correlation_id();
        match self.correlator.wait(pending, self.batch_timeout).await {
            Ok(outcome) => {
                self.cache.lock().await.settle(&commands, scene, Some(&outcome));
                if !outcome.is_fully_successful() {
                    warn!(%correlation_id, ?outcome, "switcher reported failed commands");
                }
                ReconcileOutcome::Completed {
                    correlation_id,
                    commands,
                    outcome,
                }
            }
            Err(err) => {
                self.cache.lock().await.settle(&commands, scene, None);
                warn!(%correlation_id, error = %err, "batch went unanswered");
                ReconcileOutcome::Unanswered(err)
            }
        }
    }

    async fn bump_transition(&self) {
        let value = {
            let mut state = self.state.lock().await;
            state.play_transition += 1;
            state.play_transition
        };
        self.emit(SurfaceEvent::TransitionPulse { value });
    }

    async fn mark_active(&self, request: SceneRequest) {
        let active = ActiveSceneRequest {
            request,
            applied_at: Utc::now(),
        };
        let cleared = {
            let mut state = self.state.lock().await;
            state.active_scene = Some(active.clone());
            let same = state.requested_scene.as_ref() == Some(&active.request);
            if same {
                state.requested_scene = None;
            }
            same
        };
        self.emit(SurfaceEvent::ActiveSceneRequestChanged { active });
        if cleared {
            self.emit(SurfaceEvent::SceneRequested { request: None });
        }
    }

    async fn note_current_scene(&self, scene: SceneName) {
        let changed = self.scenes.write().await.set_current_scene(scene.clone());
        if changed {
            info!(scene = %scene, "current scene changed");
            self.emit(SurfaceEvent::SceneChanged { scene_name: scene });
        }
    }

    async fn note_inventory(&self, inventory: SceneInventory) {
        for missing in self.catalog.missing_on_device(&inventory) {
            warn!(
                scene = %missing.scene,
                slot = %missing.slot,
                "declared slot not present on the switcher"
            );
        }
        self.scenes.write().await.set_inventory(inventory);
    }

    /// Entry point for everything the relay agent sends.
    pub async fn handle_relay_message(&self, message: RelayMessage) {
        match message {
            RelayMessage::BatchResult {
                correlation_id,
                outcome,
            } => {
                self.correlator.on_response(correlation_id, outcome);
            }
            RelayMessage::SceneChanged { scene_name } => self.note_current_scene(scene_name).await,
            RelayMessage::SceneInventory { scenes } => self.note_inventory(scenes).await,
            RelayMessage::DispatchBatch { correlation_id, .. } => {
                warn!(%correlation_id, "relay: ignoring dispatch_batch sent by the agent");
            }
        }
    }

    pub async fn set_relay_connected(&self, connected: bool) {
        self.state.lock().await.relay_connected = connected;
        self.emit(SurfaceEvent::RelayStatus { connected });
    }

    /// Abandons correlations older than `max_age`; their passes settle as
    /// unanswered.
    pub fn reap_expired(&self, max_age: Duration) -> usize {
        self.correlator.reap_expired(max_age).len()
    }
}

fn skipped(reason: SkipReason) -> ReconcileOutcome {
    debug!(%reason, "pass skipped");
    ReconcileOutcome::Skipped(reason)
}

#[cfg(test)]
#[path = "tests/control_tests.rs"]
mod tests;
