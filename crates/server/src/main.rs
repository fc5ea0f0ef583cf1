use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use control_core::ControlConfig;
use futures::{SinkExt, StreamExt};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{ControlSnapshot, RelayMessage, SurfaceEvent, SurfaceRequest},
};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;

use app_state::AppState;
use config::load_settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let catalog = settings
        .catalog()
        .context("invalid scene catalog in configuration")?;
    let state = Arc::new(AppState::new(ControlConfig {
        catalog,
        batch_timeout: settings.batch_timeout(),
    }));

    spawn_reaper(state.clone(), settings.pending_max_age());
    let app = build_router(state);

    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", settings.server_bind))?;
    info!(%addr, "switcher control listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/state", get(control_state))
        .route("/ws", get(surface_ws_handler))
        .route("/relay", get(relay_ws_handler))
        .with_state(state)
}

/// Periodically drops correlations nobody answered within `max_age`.
fn spawn_reaper(state: Arc<AppState>, max_age: Duration) {
    let period = (max_age / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let reaped = state.control.reap_expired(max_age);
            if reaped > 0 {
                warn!(reaped, "reaper: abandoned unanswered batches");
            }
        }
    });
}

async fn healthz() -> &'static str {
    "ok"
}

async fn control_state(State(state): State<Arc<AppState>>) -> Json<ControlSnapshot> {
    Json(state.control.snapshot().await)
}

async fn surface_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| surface_connection(state, socket))
}

async fn surface_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.control.subscribe();
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<SurfaceEvent>();

    let snapshot = state.control.snapshot().await;
    if send_json(&mut sender, &SurfaceEvent::EntireConfig { snapshot })
        .await
        .is_err()
    {
        return;
    }

    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                broadcast = events_rx.recv() => match broadcast {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "surface fell behind; events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                direct = direct_rx.recv() => match direct {
                    Some(event) => event,
                    None => break,
                },
            };
            if send_json(&mut sender, &event).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        match serde_json::from_str::<SurfaceRequest>(&text) {
            Ok(request) => {
                let control = state.control.clone();
                let direct = direct_tx.clone();
                tokio::spawn(async move {
                    let outcome = control.handle_surface_request(request).await;
                    if let Some(error) = outcome.as_ref().and_then(|o| o.surface_error()) {
                        let _ = direct.send(SurfaceEvent::Error(error));
                    }
                });
            }
            Err(error) => {
                debug!(%error, "surface: rejecting malformed request");
                let _ = direct_tx.send(SurfaceEvent::Error(ApiError::new(
                    ErrorCode::Validation,
                    format!("malformed request: {error}"),
                )));
            }
        }
    }

    send_task.abort();
}

async fn relay_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay_connection(state, socket))
}

async fn relay_connection(state: Arc<AppState>, socket: WebSocket) {
    let (generation, mut outbound) = state.relay.attach();
    info!(generation, "relay agent attached");
    state.control.set_relay_connected(true).await;

    let (mut sender, mut receiver) = socket.split();
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if send_json(&mut sender, &message).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let inbound = async {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else {
                continue;
            };
            match serde_json::from_str::<RelayMessage>(&text) {
                Ok(message) => state.control.handle_relay_message(message).await,
                Err(error) => warn!(%error, "relay: discarding malformed message"),
            }
        }
    };

    // Replacement by a newer agent ends the outbound side first.
    let replaced = tokio::select! {
        _ = &mut send_task => true,
        _ = inbound => false,
    };
    if !replaced {
        send_task.abort();
    }

    if state.relay.detach(generation) {
        info!(generation, "relay agent detached");
        state.control.set_relay_connected(false).await;
    }
}

async fn send_json<S, T>(sender: &mut S, value: &T) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
    T: serde::Serialize,
{
    match serde_json::to_string(value) {
        Ok(text) => sender.send(Message::Text(text)).await,
        Err(error) => {
            warn!(%error, "failed to encode outbound message");
            Ok(())
        }
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
