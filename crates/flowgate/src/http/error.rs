//! Mapping of engine errors onto HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::engine::FlowError;

/// JSON error body returned by every failing route
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

/// Error returned by flow route handlers
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "authentication required".to_string(),
        }
    }

    pub fn unknown_object(object_key: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("unknown object {object_key}"),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        let status = match &err {
            FlowError::Forbidden { .. } => StatusCode::FORBIDDEN,
            FlowError::NotStarted { .. } | FlowError::UnknownStep { .. } => StatusCode::NOT_FOUND,
            FlowError::Conflict { .. } | FlowError::StepNotActionable { .. } => {
                StatusCode::CONFLICT
            }
            FlowError::CallbackFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            FlowError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            FlowError::InvalidDefinition { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!("Flow request failed: {}", err);
        }

        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}
