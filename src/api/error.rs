use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, error};

/// Failures surfaced to API clients
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unknown address, or a device of the wrong kind
    #[error("not found")]
    NotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("could not encode the response: {0}")]
    Encoding(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ApiError::Encoding(e) => error!("API response encoding failed: {}", e),
            other => debug!("API request rejected: {}", other),
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
