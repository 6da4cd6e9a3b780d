use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A WAL append, fsync, or snapshot write failed. The in-memory mutation
    /// it was guarding has not been applied.
    #[error("durability failure: {0}")]
    Durability(std::io::Error),

    #[error("corrupted data: {0}")]
    Corruption(String),

    #[error("system time error: {0}")]
    SystemTime(String),

    /// Shared-password mismatch, surfaced by the dispatch layer only.
    #[error("unauthorized")]
    Unauthorized,
}

impl From<std::time::SystemTimeError> for CacheError {
    fn from(err: std::time::SystemTimeError) -> Self {
        CacheError::SystemTime(err.to_string())
    }
}

impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CacheError::Unauthorized => StatusCode::UNAUTHORIZED,
            CacheError::Io(_)
            | CacheError::Durability(_)
            | CacheError::Corruption(_)
            | CacheError::SystemTime(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
