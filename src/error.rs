//! Error types for the reconciler and JSON error responses for the API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Failure talking to the proxy's admin endpoint
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network failure, timeout, or an unreadable response body
    #[error("proxy admin request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The admin endpoint answered with a non-2xx status
    #[error("proxy admin returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body was not the JSON we expected
    #[error("malformed proxy admin response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode proxy configuration: {0}")]
    Encode(#[source] serde_json::Error),
}

impl TransportError {
    /// The remote's own error message, when the admin endpoint rejected the request
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            TransportError::Status { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// The app being reconciled has no usable binding in the registry
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("no domain configured for app {0}")]
    Domain(i64),

    #[error("no port configured for app {0}")]
    Port(i64),

    #[error("port configured for app {0} is empty")]
    EmptyPort(i64),
}

/// Error returned by a reconciliation
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The registry itself failed (not a missing record)
    #[error("registry lookup failed: {0:#}")]
    Storage(anyhow::Error),
}

impl ReconcileError {
    /// API error code for this failure
    pub fn api_code(&self) -> ApiErrorCode {
        match self {
            ReconcileError::NotFound(_) => ApiErrorCode::NotFound,
            ReconcileError::Transport(TransportError::Status { .. }) => ApiErrorCode::ProxyRejected,
            ReconcileError::Transport(_) => ApiErrorCode::ProxyUnavailable,
            ReconcileError::Storage(_) => ApiErrorCode::InternalError,
        }
    }
}

/// Error codes for API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// Unknown route, app, or missing binding
    NotFound,
    /// Unparseable or invalid request
    BadRequest,
    /// Name or domain already registered
    Conflict,
    /// The proxy admin endpoint rejected the configuration
    ProxyRejected,
    /// The proxy admin endpoint could not be reached or answered garbage
    ProxyUnavailable,
    /// Internal error
    InternalError,
}

impl ApiErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::Conflict => StatusCode::CONFLICT,
            ApiErrorCode::ProxyRejected => StatusCode::BAD_GATEWAY,
            ApiErrorCode::ProxyUnavailable => StatusCode::BAD_GATEWAY,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
    /// The error code
    pub code: ApiErrorCode,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}"}}"#,
                self.error.replace('\\', "\\\\").replace('"', "\\\"")
            )
        })
    }
}

/// Create a JSON error response with the code's default status
pub fn json_error_response(
    code: ApiErrorCode,
    message: impl Into<String>,
) -> Response<Full<Bytes>> {
    json_error_response_with_status(code.status_code(), code, message)
}

/// Create a JSON error response with an explicit status
pub fn json_error_response_with_status(
    status: StatusCode,
    code: ApiErrorCode,
    message: impl Into<String>,
) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static header")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ApiErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiErrorCode::Conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(ApiErrorCode::ProxyUnavailable.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_response_json() {
        let json =
            ErrorResponse::new(ApiErrorCode::NotFound, "no domain configured for app 3").to_json();

        assert!(json.contains("\"error\":\"no domain configured for app 3\""));
        assert!(json.contains("\"code\":\"NOT_FOUND\""));
    }

    #[test]
    fn test_json_error_response() {
        let response =
            json_error_response(ApiErrorCode::ProxyRejected, "loading config: bad handler");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_reconcile_error_codes() {
        let err = ReconcileError::from(NotFoundError::Port(4));
        assert_eq!(err.api_code(), ApiErrorCode::NotFound);
        assert_eq!(err.to_string(), "no port configured for app 4");

        let err = ReconcileError::from(TransportError::Status {
            status: 400,
            message: "unknown module: http.handlers.nope".to_string(),
        });
        assert_eq!(err.api_code(), ApiErrorCode::ProxyRejected);
        assert!(err.to_string().contains("unknown module"));

        let err = ReconcileError::Storage(anyhow::anyhow!("disk I/O error"));
        assert_eq!(err.api_code(), ApiErrorCode::InternalError);
    }

    #[test]
    fn test_remote_message() {
        let err = TransportError::Status {
            status: 400,
            message: "bad listen address".to_string(),
        };
        assert_eq!(err.remote_message(), Some("bad listen address"));

        let decode = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(TransportError::Decode(decode).remote_message(), None);
    }
}
