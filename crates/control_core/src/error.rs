use shared::{
    domain::{SceneName, SlotName},
    error::{ApiError, ErrorCode},
    protocol::CorrelationId,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("relay agent is not connected")]
    Disconnected,
    #[error("relay channel closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("failed to publish batch: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("no response for batch {0} before the deadline")]
    TimedOut(CorrelationId),
    #[error("batch {0} was abandoned before a response arrived")]
    Abandoned(CorrelationId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("scene name cannot be empty")]
    EmptySceneName,
    #[error("scene {scene} declares an empty slot name")]
    EmptySlot { scene: SceneName },
    #[error("scene {scene} declares slot {slot} more than once")]
    DuplicateSlot { scene: SceneName, slot: SlotName },
    #[error("scene {scene} slot {slot} must be MEDIA_<n> or WEB_<n>")]
    UnconventionalSlot { scene: SceneName, slot: SlotName },
}

impl From<&DispatchError> for ApiError {
    fn from(value: &DispatchError) -> Self {
        ApiError::new(ErrorCode::Unavailable, value.to_string())
    }
}

impl From<&CorrelationError> for ApiError {
    fn from(value: &CorrelationError) -> Self {
        ApiError::new(ErrorCode::Timeout, value.to_string())
    }
}
