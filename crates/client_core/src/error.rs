use reqwest::StatusCode;
use thiserror::Error;

/// Failures surfaced by the client core.
///
/// Realtime channel failures never reach facade callers; they are absorbed by
/// the reconnect loop and only show up as a state transition.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A 401 that survived the single post-refresh retry.
    #[error("request unauthorized after credential refresh")]
    Unauthorized,
    /// The refresh endpoint failed or returned no usable credential. Every
    /// request suspended behind the refresh receives the same reason.
    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),
    #[error("server returned {status}: {detail}")]
    Http { status: StatusCode, detail: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("file '{file_name}' is {size_bytes} bytes, above the {limit_bytes} byte upload limit")]
    UploadTooLarge {
        file_name: String,
        size_bytes: u64,
        limit_bytes: u64,
    },
    #[error("not logged in")]
    NotLoggedIn,
    #[error("credential storage failed: {0:#}")]
    Storage(anyhow::Error),
    #[error("realtime channel error: {0}")]
    Channel(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl ClientError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Unauthorized => Some(StatusCode::UNAUTHORIZED),
            ClientError::Http { status, .. } => Some(*status),
            ClientError::Transport(err) => err.status(),
            _ => None,
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(
            self,
            ClientError::RefreshFailed(_) | ClientError::Unauthorized
        )
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
