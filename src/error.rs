use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    JsonDecode(#[from] simd_json::Error),
    #[error("malformed historical row {index}: {reason}")]
    MalformedHistory { index: usize, reason: String },
    #[error("renderer channel closed")]
    RendererClosed,
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}
