use thiserror::Error;

/// Errors surfaced by the messaging client.
///
/// User-triggered actions (send, attach, select) return these to the caller.
/// Background work (read receipts, unread fallback, reconnects) logs them and
/// carries on.
#[derive(Debug, Error)]
pub enum Error {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("server rejected the request: {0}")]
    Rejected(String),

    #[error("push channel error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("conversation cache error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("no conversation selected")]
    NoConversationSelected,

    #[error("conversation has no recipient")]
    NoRecipient,

    #[error("nothing to send")]
    EmptyMessage,

    #[error("the same message is already being sent")]
    DuplicateSend,

    #[error("session closed")]
    SessionClosed,
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
