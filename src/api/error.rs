// src/api/error.rs

//! HTTP error mapping for the control API.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::errors::RunweaveError;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.body.code
    }
}

impl From<RunweaveError> for ApiError {
    fn from(err: RunweaveError) -> Self {
        let message = err.to_string();
        match err {
            RunweaveError::PlanNotFound(_)
            | RunweaveError::TaskNotFound(_)
            | RunweaveError::RunNotFound(_) => Self::not_found(message),
            RunweaveError::RunBusy { .. } => Self::new(StatusCode::CONFLICT, "run_busy", message),
            RunweaveError::RunStateConflict { .. }
            | RunweaveError::PlanStateConflict { .. }
            | RunweaveError::InvalidTransition { .. } => {
                Self::new(StatusCode::CONFLICT, "state_conflict", message)
            }
            RunweaveError::InvalidGraph(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_graph", message)
            }
            RunweaveError::JsonError(_) | RunweaveError::ConfigError(_) => {
                Self::bad_request(message)
            }
            RunweaveError::IoError(_) | RunweaveError::TomlError(_) | RunweaveError::Other(_) => {
                error!(error = %message, "request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: &'a ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorEnvelope { error: &self.body })).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_status_codes() {
        let busy = ApiError::from(RunweaveError::RunBusy {
            run_id: "r".into(),
        });
        assert_eq!(busy.status(), StatusCode::CONFLICT);
        assert_eq!(busy.code(), "run_busy");

        let conflict = ApiError::from(RunweaveError::RunStateConflict {
            run_id: "r".into(),
            status: "queued".into(),
            action: "resume",
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        assert_eq!(conflict.code(), "state_conflict");

        let missing = ApiError::from(RunweaveError::RunNotFound("r".into()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let graph = ApiError::from(RunweaveError::InvalidGraph("cycle".into()));
        assert_eq!(graph.status(), StatusCode::BAD_REQUEST);
    }
}
