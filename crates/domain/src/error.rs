/// Shared error type used across all Relay crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("gateway {gateway}: {message}")]
    Gateway { gateway: String, message: String },

    #[error("store: {0}")]
    Store(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("session {0} is busy: a run is already in progress")]
    SessionBusy(String),

    #[error("step runner: {0}")]
    Step(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
