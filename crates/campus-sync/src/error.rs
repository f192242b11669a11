use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("change feed: {0}")]
    Feed(String),

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("view closed before the result arrived")]
    Cancelled,

    #[error("missing configuration: {0}")]
    Config(&'static str),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Feed(e.to_string())
    }
}
