use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Identity already initialized")]
    AlreadyInitialized,

    #[error("Identity not initialized")]
    NotInitialized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid key rotation")]
    InvalidRotation,

    #[error("Core error: {0}")]
    Core(#[from] wopr_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
