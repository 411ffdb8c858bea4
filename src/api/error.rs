//! HTTP boundary error type: maps `CoreError` onto the status codes and
//! flat JSON error bodies named in spec §6/§7 (`{error:"..."}`, with the
//! `409` transition case carrying `from`/`to` alongside).
//!
//! Grounded on the teacher's `api::error::ApiError` (`thiserror` enum +
//! `IntoResponse` + `status_code()`), narrowed to the flat wire shape
//! this API actually promises instead of the teacher's `{success,error,
//! message,code}` envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::CoreError;

/// API result type used by every handler.
pub type ApiResult<T> = Result<T, ApiError>;

/// Thin wrapper so `CoreError` (core-crate taxonomy) can carry the extra
/// wire fields spec §6 asks for on a `409` without polluting `CoreError`
/// itself with HTTP concerns.
#[derive(Debug)]
pub struct ApiError {
    pub source: CoreError,
    pub status: StatusCode,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ApiError {
    fn status_for(source: &CoreError) -> StatusCode {
        match source {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::AlreadyExists(_) => StatusCode::CONFLICT,
            CoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::DriverFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Timeout => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `404 {error:"run not found"}`-style mapping with no extra fields.
    pub fn from_core(source: CoreError) -> Self {
        let status = Self::status_for(&source);
        Self { source, status, extra: serde_json::Map::new() }
    }

    /// `409 {error:"invalid status transition",from,to:"cancelled"}`:
    /// the transition case needs `from`/`to` alongside the message.
    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        let to = to.into();
        let source = CoreError::InvalidTransition { from: from.into(), to: to.clone() };
        let status = Self::status_for(&source);
        let mut extra = serde_json::Map::new();
        if let CoreError::InvalidTransition { from, to } = &source {
            extra.insert("from".to_string(), serde_json::Value::String(from.clone()));
            extra.insert("to".to_string(), serde_json::Value::String(to.clone()));
        }
        Self { source, status, extra }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::from_core(CoreError::Validation(message.into()))
    }

    pub fn unauthorized() -> Self {
        Self {
            source: CoreError::Validation("unauthorized".to_string()),
            status: StatusCode::UNAUTHORIZED,
            extra: serde_json::Map::new(),
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            source: CoreError::Validation("rate limit exceeded".to_string()),
            status: StatusCode::TOO_MANY_REQUESTS,
            extra: serde_json::Map::new(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(source: CoreError) -> Self {
        Self::from_core(source)
    }
}

impl ApiError {
    /// The exact `error` message text the wire contract names for each
    /// variant (spec §6), rather than `CoreError`'s `Display` text (which
    /// carries internal detail like an entity kind or id not meant for
    /// the wire).
    fn wire_message(&self) -> String {
        match &self.source {
            CoreError::NotFound(_) => "run not found".to_string(),
            CoreError::InvalidTransition { .. } => "invalid status transition".to_string(),
            CoreError::Validation(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(status = %self.status, reason = self.source.reason(), "api error");
        let message = self.wire_message();
        let mut body = self.extra;
        body.insert("error".to_string(), serde_json::Value::String(message));
        (self.status, Json(serde_json::Value::Object(body))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err = ApiError::from_core(CoreError::NotFound("run r1".to_string()));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.wire_message(), "run not found");
    }

    #[test]
    fn validation_message_passes_through_verbatim() {
        let err = ApiError::bad_request("invalid checkpoint type");
        assert_eq!(err.wire_message(), "invalid checkpoint type");
    }

    #[test]
    fn invalid_transition_carries_from_and_to() {
        let err = ApiError::invalid_transition("succeeded", "cancelled");
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.extra.get("from").unwrap(), "succeeded");
        assert_eq!(err.extra.get("to").unwrap(), "cancelled");
        assert_eq!(err.wire_message(), "invalid status transition");
    }

    #[test]
    fn validation_maps_to_400() {
        let err = ApiError::from_core(CoreError::Validation("bad plan".to_string()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
