use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// Non-success response from a webhook. `message` is the server text when
    /// it sent one, otherwise a generic line carrying the status code.
    #[error("{message}")]
    Webhook { status: u16, message: String },
    #[error("unknown record field: {section}.{key}")]
    UnknownField { section: String, key: String },
    #[error("{0}")]
    Parse(String),
}

impl AppError {
    pub fn is_network(&self) -> bool {
        matches!(self, AppError::Http(_) | AppError::Webhook { .. })
    }
}
