use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use crate::markup::MarkupError;
use chatbridge_sdk_rs::backend::BackendError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("client_id is required")]
    MissingClientId,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("an event stream is already open for client {0}")]
    StreamTaken(String),
    #[error("render failed: {0}")]
    Render(#[from] MarkupError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::MissingClientId => StatusCode::BAD_REQUEST,
            AppError::Backend(BackendError::AlreadyRunning) | AppError::StreamTaken(_) => {
                StatusCode::CONFLICT
            }
            AppError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}
