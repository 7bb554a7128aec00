//! Error handling and JSON error responses for the console API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use serde_json::Value;

/// Header carrying the machine-readable error code
pub const ERROR_CODE_HEADER: &str = "X-Error-Code";

/// Error codes for API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// No valid session
    Unauthorized,
    /// Session lacks the role or ownership required
    Forbidden,
    /// Unknown resource or route
    NotFound,
    /// A required field is empty or absent
    MissingFields,
    /// A field failed validation, or the body is not valid JSON
    InvalidInput,
    /// First-run setup attempted after users exist
    SetupCompleted,
    /// Email already registered
    EmailInUse,
    /// Login failed
    InvalidCredentials,
    /// Record stored but Caddy rejected or missed the change
    CaddySyncFailed,
    /// Caddy admin API could not be reached or errored
    CaddyUnavailable,
    /// Unexpected server error
    InternalError,
}

impl ApiErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::MissingFields => StatusCode::BAD_REQUEST,
            ApiErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ApiErrorCode::SetupCompleted => StatusCode::BAD_REQUEST,
            ApiErrorCode::EmailInUse => StatusCode::BAD_REQUEST,
            ApiErrorCode::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiErrorCode::CaddySyncFailed => StatusCode::BAD_GATEWAY,
            ApiErrorCode::CaddyUnavailable => StatusCode::BAD_GATEWAY,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Error-Code header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::Forbidden => "FORBIDDEN",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::MissingFields => "MISSING_FIELDS",
            ApiErrorCode::InvalidInput => "INVALID_INPUT",
            ApiErrorCode::SetupCompleted => "SETUP_COMPLETED",
            ApiErrorCode::EmailInUse => "EMAIL_IN_USE",
            ApiErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ApiErrorCode::CaddySyncFailed => "CADDY_SYNC_FAILED",
            ApiErrorCode::CaddyUnavailable => "CADDY_UNAVAILABLE",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
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
    /// HTTP status code (for reference)
    pub status: u16,
    /// Extra payload, e.g. the stored record when only the Caddy push failed
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code,
            status: code.status_code().as_u16(),
            details: None,
        }
    }

    /// Attach extra top-level fields. Non-object values are ignored.
    pub fn with_details(mut self, details: Value) -> Self {
        if details.is_object() {
            self.details = Some(details);
        }
        self
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","code":"{}","status":{}}}"#,
                self.error.replace('\"', "\\\""),
                self.code.as_header_value(),
                self.status
            )
        })
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let status = self.code.status_code();
        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header(ERROR_CODE_HEADER, self.code.as_header_value())
            .body(Full::new(Bytes::from(self.to_json())))
            .expect("valid response with StatusCode enum and static headers")
    }
}

/// Create a JSON error response with X-Error-Code header
pub fn json_error_response(code: ApiErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    ErrorResponse::new(code, message).into_response()
}
