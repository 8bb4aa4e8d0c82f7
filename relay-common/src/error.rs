use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// The error taxonomy carried through the Relay subsystem.
///
/// Every boundary (RelayHTTP, RelayHub, RelayClient) maps whatever it raises
/// into one of these before it crosses a crate edge, so the wire surface has
/// exactly one vocabulary to translate to HTTP status / RPC fault.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("wrong relay mode for this endpoint")]
    ModeMismatch,
    #[error("agent disconnected")]
    AgentDisconnected,
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RelayError::ModeMismatch => StatusCode::FORBIDDEN,
            RelayError::AgentDisconnected => StatusCode::BAD_GATEWAY,
            RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Cancelled => StatusCode::from_u16(499).unwrap(),
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            RelayError::Unauthorized(_) => "unauthorized",
            RelayError::NotFound(_) => "not_found",
            RelayError::BadRequest(_) => "bad_request",
            RelayError::UnsupportedMediaType(_) => "unsupported_media_type",
            RelayError::ModeMismatch => "mode_mismatch",
            RelayError::AgentDisconnected => "agent_disconnected",
            RelayError::Timeout(_) => "timeout",
            RelayError::Cancelled => "cancelled",
            RelayError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({
            "error": { "code": self.code(), "message": self.to_string() }
        }));
        (status, body).into_response()
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_cancelled_to_499() {
        assert_eq!(RelayError::Cancelled.status_code().as_u16(), 499);
    }

    #[test]
    fn maps_unauthorized_to_401() {
        assert_eq!(
            RelayError::Unauthorized("bad credential".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }
}
