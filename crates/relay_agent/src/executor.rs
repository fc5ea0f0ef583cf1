use async_trait::async_trait;
use shared::{
    domain::SceneName,
    protocol::{BatchOutcome, DeviceCommand, SceneInventory},
};
use tokio::sync::broadcast;

/// The switcher as seen by the relay client.
#[async_trait]
pub trait DeviceExecutor: Send + Sync {
    /// Runs the batch in order without halting on failures. The outcome
    /// carries one result per command.
    async fn execute_batch(&self, commands: Vec<DeviceCommand>) -> BatchOutcome;

    async fn current_scene(&self) -> anyhow::Result<SceneName>;

    /// Re-reads the scene to slot to item id mapping from the device.
    async fn scene_inventory(&self) -> anyhow::Result<SceneInventory>;

    fn scene_changes(&self) -> broadcast::Receiver<SceneName>;

    fn is_connected(&self) -> bool;
}
