//! Mapping runtime failures onto HTTP responses.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::RuntimeError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: msg.into(),
            retry_after: None,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: msg.into(),
            retry_after: None,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: msg.into(),
            retry_after: None,
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        let status = match &err {
            RuntimeError::NotFound(_) => StatusCode::NOT_FOUND,
            RuntimeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RuntimeError::Busy { .. } => StatusCode::TOO_MANY_REQUESTS,
            RuntimeError::IncompatibleEnvironment { .. } => StatusCode::CONFLICT,
            RuntimeError::LoadError { .. } | RuntimeError::ReadinessTimeout { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RuntimeError::GenerationError { .. } => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            code: err.code(),
            retry_after: err.is_retryable().then_some(1),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "type": match self.status {
                    StatusCode::BAD_REQUEST => "invalid_request_error",
                    StatusCode::NOT_FOUND => "not_found_error",
                    StatusCode::TOO_MANY_REQUESTS => "rate_limit_error",
                    _ => "server_error",
                },
                "param": null,
                "code": self.code,
            }
        }));
        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
