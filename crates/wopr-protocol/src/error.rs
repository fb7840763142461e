use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out")]
    Timeout,

    #[error("Malformed frame: {0}")]
    Parse(String),

    #[error("Trust error: {0}")]
    Trust(#[from] wopr_trust::Error),

    #[error("Core error: {0}")]
    Core(#[from] wopr_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
