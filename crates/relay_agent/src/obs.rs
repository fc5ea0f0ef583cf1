//! obs-websocket 5.x session acting as the agent's device executor.
//!
//! Requests are correlated by `requestId`; command batches go out as one
//! `RequestBatch` executed serially in realtime so `Sleep` pauses apply.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use shared::{
    domain::{SceneName, SlotName},
    error::{ApiError, ErrorCode},
    protocol::{BatchOutcome, CommandResult, DeviceCommand, SceneInventory, TransformSize},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::{error::ObsError, executor::DeviceExecutor};

pub const DEFAULT_SOURCE_PREFIX: &str = "RI3D_";

const RPC_VERSION: u32 = 1;
/// `EventSubscription::Scenes`
const SCENE_EVENTS: u32 = 1 << 2;
/// `RequestBatchExecutionType::SerialRealtime`
const SERIAL_REALTIME: i32 = 0;
/// `RequestStatus::ResourceNotFound`
const RESOURCE_NOT_FOUND: u32 = 600;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

mod op {
    pub const HELLO: u32 = 0;
    pub const IDENTIFY: u32 = 1;
    pub const IDENTIFIED: u32 = 2;
    pub const EVENT: u32 = 5;
    pub const REQUEST: u32 = 6;
    pub const REQUEST_RESPONSE: u32 = 7;
    pub const REQUEST_BATCH: u32 = 8;
    pub const REQUEST_BATCH_RESPONSE: u32 = 9;
}

type ObsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = HashMap<String, oneshot::Sender<Value>>;

#[derive(Debug, Clone)]
pub struct ObsConfig {
    pub url: String,
    pub password: Option<String>,
    pub source_prefix: String,
}

#[derive(Debug, Deserialize)]
struct ObsMessage {
    op: u32,
    d: Value,
}

#[derive(Debug, Deserialize)]
struct Hello {
    authentication: Option<AuthChallenge>,
}

#[derive(Debug, Deserialize)]
struct AuthChallenge {
    challenge: String,
    salt: String,
}

#[derive(Debug, Deserialize)]
struct RequestStatus {
    result: bool,
    code: u32,
    #[serde(default)]
    comment: Option<String>,
}

/// `base64(sha256(base64(sha256(password + salt)) + challenge))`
pub(crate) fn generate_auth_string(password: &str, challenge: &str, salt: &str) -> String {
    let engine = base64::engine::general_purpose::STANDARD;
    let secret = engine.encode(Sha256::digest(format!("{password}{salt}").as_bytes()));
    engine.encode(Sha256::digest(format!("{secret}{challenge}").as_bytes()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ObsSession {
    source_prefix: String,
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<Mutex<PendingMap>>,
    scene_changes: broadcast::Sender<SceneName>,
    inventory: Mutex<SceneInventory>,
    connected: Arc<AtomicBool>,
    next_request_id: AtomicU64,
}

impl ObsSession {
    pub async fn connect(config: &ObsConfig) -> Result<Arc<Self>, ObsError> {
        let (mut socket, _) = connect_async(config.url.as_str()).await?;
        handshake(&mut socket, config.password.as_deref()).await?;
        info!(url = %config.url, "obs: identified");

        let (mut sink, mut stream) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Arc<Mutex<PendingMap>> = Arc::default();
        let (scene_changes, _) = broadcast::channel(32);
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        {
            let pending = Arc::clone(&pending);
            let scene_changes = scene_changes.clone();
            let connected = Arc::clone(&connected);
            tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(Message::Text(text)) => route_inbound(&text, &pending, &scene_changes),
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                connected.store(false, Ordering::SeqCst);
                // Dropping the senders fails every in-flight request.
                lock(&pending).clear();
                warn!("obs: connection closed");
            });
        }

        Ok(Arc::new(Self {
            source_prefix: config.source_prefix.clone(),
            outbound,
            pending,
            scene_changes,
            inventory: Mutex::new(SceneInventory::new()),
            connected,
            next_request_id: AtomicU64::new(1),
        }))
    }

    async fn roundtrip(
        &self,
        op_code: u32,
        request_type: &str,
        mut body: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, ObsError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ObsError::Closed);
        }
        let request_id = self
            .next_request_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        body.insert("requestId".into(), json!(request_id));

        let (completion, response) = oneshot::channel();
        lock(&self.pending).insert(request_id.clone(), completion);
        let frame = json!({ "op": op_code, "d": body }).to_string();
        if self.outbound.send(Message::Text(frame)).is_err() {
            lock(&self.pending).remove(&request_id);
            return Err(ObsError::Closed);
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(d)) => Ok(d),
            Ok(Err(_)) => Err(ObsError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&request_id);
                Err(ObsError::Timeout {
                    request_type: request_type.to_string(),
                })
            }
        }
    }

    /// Sends one request and returns its `responseData` (or `null`).
    pub async fn request(
        &self,
        request_type: &str,
        request_data: Option<Value>,
    ) -> Result<Value, ObsError> {
        let mut body = Map::new();
        body.insert("requestType".into(), json!(request_type));
        if let Some(data) = request_data {
            body.insert("requestData".into(), data);
        }
        let response = self
            .roundtrip(op::REQUEST, request_type, body, REQUEST_TIMEOUT)
            .await?;

        let status = parse_status(request_type, &response)?;
        if !status.result {
            return Err(ObsError::Request {
                request_type: request_type.to_string(),
                code: status.code,
                comment: status.comment.unwrap_or_default(),
            });
        }
        Ok(response.get("responseData").cloned().unwrap_or(Value::Null))
    }

    /// Runs `requests` as one serial batch that keeps going past failures.
    pub async fn request_batch(
        &self,
        requests: Vec<Value>,
        timeout: Duration,
    ) -> Result<Vec<CommandResult>, ObsError> {
        let expected = requests.len();
        let mut body = Map::new();
        body.insert("haltOnFailure".into(), json!(false));
        body.insert("executionType".into(), json!(SERIAL_REALTIME));
        body.insert("requests".into(), Value::Array(requests));
        let response = self
            .roundtrip(op::REQUEST_BATCH, "RequestBatch", body, timeout)
            .await?;

        let results = response
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| ObsError::Malformed("RequestBatch response without results".into()))?
            .iter()
            .map(|result| {
                let request_type = result
                    .get("requestType")
                    .and_then(Value::as_str)
                    .unwrap_or("RequestBatch");
                let status = parse_status(request_type, result)?;
                Ok(CommandResult {
                    ok: status.result,
                    code: status.code,
                    comment: status.comment,
                })
            })
            .collect::<Result<Vec<_>, ObsError>>()?;

        if results.len() != expected {
            return Err(ObsError::Malformed(format!(
                "RequestBatch returned {} results for {expected} requests",
                results.len()
            )));
        }
        Ok(results)
    }
}

async fn handshake(socket: &mut ObsSocket, password: Option<&str>) -> Result<(), ObsError> {
    let hello = read_message(socket).await?;
    if hello.op != op::HELLO {
        return Err(ObsError::Handshake(hello.op));
    }
    let hello: Hello = serde_json::from_value(hello.d)?;

    let mut identify = Map::new();
    identify.insert("rpcVersion".into(), json!(RPC_VERSION));
    identify.insert("eventSubscriptions".into(), json!(SCENE_EVENTS));
    if let Some(auth) = hello.authentication {
        let password = password.ok_or(ObsError::PasswordRequired)?;
        identify.insert(
            "authentication".into(),
            json!(generate_auth_string(password, &auth.challenge, &auth.salt)),
        );
    }
    let frame = json!({ "op": op::IDENTIFY, "d": identify }).to_string();
    socket.send(Message::Text(frame)).await?;

    // A rejected password shows up as the server closing the socket.
    let identified = read_message(socket).await?;
    if identified.op != op::IDENTIFIED {
        return Err(ObsError::Handshake(identified.op));
    }
    Ok(())
}

async fn read_message(socket: &mut ObsSocket) -> Result<ObsMessage, ObsError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
            Some(Ok(Message::Close(_))) | None => return Err(ObsError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

fn route_inbound(
    text: &str,
    pending: &Mutex<PendingMap>,
    scene_changes: &broadcast::Sender<SceneName>,
) {
    let message: ObsMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(error) => {
            debug!(%error, "obs: unparsable frame");
            return;
        }
    };
    match message.op {
        op::REQUEST_RESPONSE | op::REQUEST_BATCH_RESPONSE => {
            let Some(request_id) = message.d.get("requestId").and_then(Value::as_str) else {
                return;
            };
            let completion = lock(pending).remove(request_id);
            match completion {
                Some(completion) => {
                    let _ = completion.send(message.d);
                }
                None => debug!(request_id, "obs: response for unknown request"),
            }
        }
        op::EVENT => {
            let event_type = message.d.get("eventType").and_then(Value::as_str);
            if event_type == Some("CurrentProgramSceneChanged") {
                if let Some(scene) = message
                    .d
                    .pointer("/eventData/sceneName")
                    .and_then(Value::as_str)
                {
                    let _ = scene_changes.send(SceneName::from(scene));
                }
            }
        }
        other => debug!(op = other, "obs: ignoring message"),
    }
}

fn parse_status(request_type: &str, response: &Value) -> Result<RequestStatus, ObsError> {
    let status = response
        .get("requestStatus")
        .ok_or_else(|| ObsError::Malformed(format!("{request_type} response without requestStatus")))?;
    Ok(serde_json::from_value(status.clone())?)
}

/// One batch entry: either a request for the device or a result decided locally.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Planned {
    Send(Value),
    Local(CommandResult),
}

fn batch_entry(request_type: &str, request_data: Value) -> Planned {
    Planned::Send(json!({ "requestType": request_type, "requestData": request_data }))
}

fn item_entry(
    inventory: &SceneInventory,
    prefix: &str,
    scene: &SceneName,
    slot: &SlotName,
    request_type: &str,
    build: impl FnOnce(i64) -> Value,
) -> Planned {
    match inventory.get(scene).and_then(|items| items.get(slot)) {
        Some(item_id) => batch_entry(request_type, build(*item_id)),
        None => Planned::Local(CommandResult::failure(
            RESOURCE_NOT_FOUND,
            format!("no {prefix}{slot} item in scene {scene}"),
        )),
    }
}

pub(crate) fn translate(command: &DeviceCommand, inventory: &SceneInventory, prefix: &str) -> Planned {
    match command {
        DeviceCommand::SceneSwitch { scene_name } => {
            batch_entry("SetCurrentProgramScene", json!({ "sceneName": scene_name }))
        }
        DeviceCommand::Pause { duration_ms } => {
            batch_entry("Sleep", json!({ "sleepMillis": duration_ms }))
        }
        DeviceCommand::Transform {
            scene_name,
            slot_name,
            position_x,
            position_y,
            size,
        } => item_entry(
            inventory,
            prefix,
            scene_name,
            slot_name,
            "SetSceneItemTransform",
            |item_id| {
                let mut transform = Map::new();
                transform.insert("positionX".into(), json!(position_x));
                transform.insert("positionY".into(), json!(position_y));
                match size {
                    TransformSize::Width { width } => {
                        transform.insert("width".into(), json!(width));
                    }
                    TransformSize::Scale { scale_x, scale_y } => {
                        transform.insert("scaleX".into(), json!(scale_x));
                        transform.insert("scaleY".into(), json!(scale_y));
                    }
                }
                json!({
                    "sceneName": scene_name,
                    "sceneItemId": item_id,
                    "sceneItemTransform": transform,
                })
            },
        ),
        DeviceCommand::Enable {
            scene_name,
            slot_name,
            enabled,
        } => item_entry(
            inventory,
            prefix,
            scene_name,
            slot_name,
            "SetSceneItemEnabled",
            |item_id| {
                json!({
                    "sceneName": scene_name,
                    "sceneItemId": item_id,
                    "sceneItemEnabled": enabled,
                })
            },
        ),
        DeviceCommand::SetContent {
            slot_name,
            settings,
        } => batch_entry(
            "SetInputSettings",
            json!({
                "inputName": format!("{prefix}{slot_name}"),
                "inputSettings": settings,
                "overlay": true,
            }),
        ),
    }
}

/// Puts device results back between the locally decided ones, in order.
pub(crate) fn merge_results(planned: Vec<Planned>, sent: Vec<CommandResult>) -> Vec<CommandResult> {
    let mut sent = sent.into_iter();
    planned
        .into_iter()
        .map(|entry| match entry {
            Planned::Local(result) => result,
            Planned::Send(_) => sent
                .next()
                .unwrap_or_else(|| CommandResult::failure(RESOURCE_NOT_FOUND, "missing batch result")),
        })
        .collect()
}

/// Prefixed sources of one `GetSceneItemList` response, keyed by slot.
pub(crate) fn slots_from_items(response_data: &Value, prefix: &str) -> BTreeMap<SlotName, i64> {
    response_data
        .get("sceneItems")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| {
            let source = item.get("sourceName")?.as_str()?;
            let slot = source.strip_prefix(prefix).filter(|s| !s.is_empty())?;
            let item_id = item.get("sceneItemId")?.as_i64()?;
            Some((SlotName::from(slot), item_id))
        })
        .collect()
}

#[async_trait]
impl DeviceExecutor for ObsSession {
    async fn execute_batch(&self, commands: Vec<DeviceCommand>) -> BatchOutcome {
        let planned: Vec<Planned> = {
            let inventory = lock(&self.inventory);
            commands
                .iter()
                .map(|command| translate(command, &inventory, &self.source_prefix))
                .collect()
        };
        let requests: Vec<Value> = planned
            .iter()
            .filter_map(|entry| match entry {
                Planned::Send(request) => Some(request.clone()),
                Planned::Local(_) => None,
            })
            .collect();

        let sent = if requests.is_empty() {
            Vec::new()
        } else {
            let paused_ms: u64 = commands
                .iter()
                .map(|command| match command {
                    DeviceCommand::Pause { duration_ms } => *duration_ms,
                    _ => 0,
                })
                .sum();
            let timeout = REQUEST_TIMEOUT + Duration::from_millis(paused_ms);
            match self.request_batch(requests, timeout).await {
                Ok(results) => results,
                Err(err) => {
                    warn!(error = %err, "obs: batch failed");
                    return BatchOutcome::Failed {
                        error: ApiError::new(ErrorCode::Device, err.to_string()),
                    };
                }
            }
        };

        BatchOutcome::Completed {
            results: merge_results(planned, sent),
        }
    }

    async fn current_scene(&self) -> anyhow::Result<SceneName> {
        let data = self.request("GetCurrentProgramScene", None).await?;
        let scene = data
            .get("currentProgramSceneName")
            .or_else(|| data.get("sceneName"))
            .and_then(Value::as_str)
            .ok_or_else(|| ObsError::Malformed("GetCurrentProgramScene without a scene name".into()))?;
        Ok(SceneName::from(scene))
    }

    async fn scene_inventory(&self) -> anyhow::Result<SceneInventory> {
        let data = self.request("GetSceneList", None).await?;
        let names: Vec<String> = data
            .get("scenes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|scene| scene.get("sceneName")?.as_str().map(str::to_string))
            .collect();

        let mut inventory = SceneInventory::new();
        for name in names {
            let items = self
                .request("GetSceneItemList", Some(json!({ "sceneName": name })))
                .await?;
            inventory.insert(
                SceneName::from(name),
                slots_from_items(&items, &self.source_prefix),
            );
        }
        *lock(&self.inventory) = inventory.clone();
        debug!(scenes = inventory.len(), "obs: inventory refreshed");
        Ok(inventory)
    }

    fn scene_changes(&self) -> broadcast::Receiver<SceneName> {
        self.scene_changes.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[path = "tests/obs_tests.rs"]
mod tests;
