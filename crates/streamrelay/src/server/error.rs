//! HTTP error bodies.
//!
//! Management routes answer with [`ApiError`]; `/proxy` keeps its own
//! `{error, message, url}` shape so players and the manifest resolver can read it.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::{CacheError, RelayError};

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        tracing::error!(error = %err, "Cache operation failed");
        let api = ApiError::internal(err.to_string());
        match &err {
            CacheError::Metadata { path, .. } => api.with_details(serde_json::json!({
                "path": path.display().to_string(),
            })),
            _ => api,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Error body of the relay endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyFailure {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<u16>,
    #[serde(skip)]
    status: StatusCode,
}

impl ProxyFailure {
    pub fn missing_url() -> Self {
        Self {
            error: "Missing URL parameter".to_string(),
            message: "the `url` query parameter is required".to_string(),
            url: None,
            attempts: None,
            last_status: None,
            status: StatusCode::BAD_REQUEST,
        }
    }

    pub fn from_relay(url: &str, err: &RelayError) -> Self {
        if err.is_client_error() {
            return Self {
                error: "Invalid URL parameter".to_string(),
                message: err.to_string(),
                url: Some(url.to_string()),
                attempts: None,
                last_status: None,
                status: StatusCode::BAD_REQUEST,
            };
        }
        Self {
            error: "Proxy request failed".to_string(),
            message: err.to_string(),
            url: Some(url.to_string()),
            attempts: err.attempts(),
            last_status: err.last_status().map(|s| s.as_u16()),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Failure that did not come out of the retry loop (e.g. a body read error).
    pub fn other(url: &str, message: impl Into<String>) -> Self {
        Self {
            error: "Proxy request failed".to_string(),
            message: message.into(),
            url: Some(url.to_string()),
            attempts: None,
            last_status: None,
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ProxyFailure {
    fn into_response(self) -> Response {
        let status = self.status;
        let mut response = (status, Json(self)).into_response();
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        response
    }
}
