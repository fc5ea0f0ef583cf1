//! Agent side of the relay: answers dispatched batches and reports what the
//! switcher shows.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use shared::protocol::RelayMessage;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::executor::DeviceExecutor;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    pub server_url: String,
    pub reconnect_delay: Duration,
}

/// Turns the control server's base URL into its `/relay` websocket URL.
pub fn relay_ws_url(server_url: &str) -> Result<Url> {
    let mut url = Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(anyhow!("unsupported server url scheme: {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot use scheme {scheme} for {server_url}"))?;
    url.set_path("/relay");
    Ok(url)
}

/// Keeps a relay session up until the executor loses its device.
pub async fn run_relay_client(
    config: RelayClientConfig,
    executor: Arc<dyn DeviceExecutor>,
) -> Result<()> {
    let url = relay_ws_url(&config.server_url)?;
    while executor.is_connected() {
        match relay_session(&url, executor.clone()).await {
            Ok(()) => info!(%url, "relay: session ended"),
            Err(err) => warn!(%url, error = %err, "relay: session failed"),
        }
        if !executor.is_connected() {
            break;
        }
        tokio::time::sleep(config.reconnect_delay).await;
    }
    Ok(())
}

/// One connection to the relay. Returns when either side goes away.
pub async fn relay_session(url: &Url, executor: Arc<dyn DeviceExecutor>) -> Result<()> {
    let (socket, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect relay websocket: {url}"))?;
    info!(%url, "relay: connected");
    let (mut writer, mut reader) = socket.split();

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<RelayMessage>();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(error) => {
                    warn!(%error, "relay: failed to encode message");
                    continue;
                }
            };
            if writer.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut scene_changes = executor.scene_changes();
    let scene_name = executor.current_scene().await?;
    let _ = outbound.send(RelayMessage::SceneChanged { scene_name });
    let scenes = executor.scene_inventory().await?;
    let _ = outbound.send(RelayMessage::SceneInventory { scenes });

    let result = loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_inbound(&text, &executor, &outbound),
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(err)) => break Err(err.into()),
            },
            change = scene_changes.recv() => match change {
                Ok(scene_name) => {
                    debug!(scene = %scene_name, "relay: forwarding scene change");
                    let _ = outbound.send(RelayMessage::SceneChanged { scene_name });
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "relay: scene changes dropped");
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    writer_task.abort();
    result
}

fn handle_inbound(
    text: &str,
    executor: &Arc<dyn DeviceExecutor>,
    outbound: &mpsc::UnboundedSender<RelayMessage>,
) {
    let message = match serde_json::from_str::<RelayMessage>(text) {
        Ok(message) => message,
        Err(error) => {
            warn!(%error, "relay: discarding malformed message");
            return;
        }
    };
    let RelayMessage::DispatchBatch {
        correlation_id,
        commands,
    } = message
    else {
        debug!("relay: ignoring message meant for the control process");
        return;
    };

    let executor = Arc::clone(executor);
    let outbound = outbound.clone();
    tokio::spawn(async move {
        debug!(%correlation_id, commands = commands.len(), "relay: executing batch");
        let outcome = executor.execute_batch(commands).await;
        if !outcome.is_fully_successful() {
            warn!(%correlation_id, ?outcome, "relay: batch had failures");
        }
        let _ = outbound.send(RelayMessage::BatchResult {
            correlation_id,
            outcome,
        });
    });
}

#[cfg(test)]
#[path = "tests/relay_client_tests.rs"]
mod tests;
