use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Platform-wide error kinds.
///
/// Component-local errors are translated into one of these variants exactly
/// once, at the component boundary. The HTTP layer maps each kind to a
/// status code; internal detail never crosses the wire beyond the message.
pub enum PlatformError {
    /// Malformed or semantically invalid request.
    InvalidRequest(String),

    /// Missing or unverifiable credentials.
    Unauthorized(String),

    /// Valid credentials lacking a required permission.
    Forbidden(String),

    /// The named entity does not exist.
    NotFound(String),

    /// Duplicate id, dependency cycle, or live dependents.
    Conflict(String),

    /// A lifecycle precondition does not hold (e.g. dependency not started).
    PreconditionFailed(String),

    /// Peer, resource, or subsystem is offline.
    Unavailable(String),

    /// Everything else.
    Internal(String),
}

impl PlatformError {
    /// The HTTP status this kind maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            PlatformError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PlatformError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            PlatformError::Forbidden(_) => StatusCode::FORBIDDEN,
            PlatformError::NotFound(_) => StatusCode::NOT_FOUND,
            PlatformError::Conflict(_) => StatusCode::CONFLICT,
            PlatformError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            PlatformError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PlatformError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            PlatformError::InvalidRequest(m)
            | PlatformError::Unauthorized(m)
            | PlatformError::Forbidden(m)
            | PlatformError::NotFound(m)
            | PlatformError::Conflict(m)
            | PlatformError::PreconditionFailed(m)
            | PlatformError::Unavailable(m)
            | PlatformError::Internal(m) => m,
        }
    }
}

impl IntoResponse for PlatformError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message() });
        (self.status(), Json(body)).into_response()
    }
}

impl std::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformError::InvalidRequest(m) => write!(f, "invalid request: {m}"),
            PlatformError::Unauthorized(m) => write!(f, "unauthorized: {m}"),
            PlatformError::Forbidden(m) => write!(f, "forbidden: {m}"),
            PlatformError::NotFound(m) => write!(f, "not found: {m}"),
            PlatformError::Conflict(m) => write!(f, "conflict: {m}"),
            PlatformError::PreconditionFailed(m) => write!(f, "precondition failed: {m}"),
            PlatformError::Unavailable(m) => write!(f, "unavailable: {m}"),
            PlatformError::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

impl std::fmt::Debug for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for PlatformError {}

impl From<std::io::Error> for PlatformError {
    fn from(err: std::io::Error) -> Self {
        PlatformError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for PlatformError {
    fn from(err: serde_json::Error) -> Self {
        PlatformError::InvalidRequest(err.to_string())
    }
}
