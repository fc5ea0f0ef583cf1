use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObsError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid json from obs: {0}")]
    Json(#[from] serde_json::Error),
    #[error("obs requires authentication but no password was configured")]
    PasswordRequired,
    #[error("unexpected message during handshake (op {0})")]
    Handshake(u32),
    #[error("obs connection closed")]
    Closed,
    #[error("no response to {request_type} in time")]
    Timeout { request_type: String },
    #[error("{request_type} failed with code {code}: {comment}")]
    Request {
        request_type: String,
        code: u32,
        comment: String,
    },
    #[error("malformed response: {0}")]
    Malformed(String),
}
