use noplacelike_core::PlatformError;

/// Token and channel-crypto failures.
#[derive(Debug)]
pub enum SecurityError {
    /// The Authorization header is missing from the request.
    MissingAuthHeader,

    /// The authorization scheme is not "Bearer".
    InvalidAuthScheme,

    /// The token is malformed or carries a bad signature.
    InvalidToken(String),

    /// Token is well-formed but lacks a required permission.
    InsufficientPermissions,

    /// Sealing or opening a channel frame failed.
    CryptoFailure(String),
}

impl std::fmt::Display for SecurityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityError::MissingAuthHeader => write!(f, "authorization required"),
            SecurityError::InvalidAuthScheme => write!(f, "invalid authorization scheme"),
            SecurityError::InvalidToken(msg) => write!(f, "invalid token: {msg}"),
            SecurityError::InsufficientPermissions => write!(f, "insufficient permissions"),
            SecurityError::CryptoFailure(msg) => write!(f, "channel crypto failure: {msg}"),
        }
    }
}

impl std::error::Error for SecurityError {}

impl From<SecurityError> for PlatformError {
    fn from(err: SecurityError) -> Self {
        match err {
            SecurityError::MissingAuthHeader => {
                PlatformError::Unauthorized("authorization required".to_string())
            }
            SecurityError::InvalidAuthScheme => {
                PlatformError::Unauthorized("invalid authorization scheme".to_string())
            }
            SecurityError::InvalidToken(_) => {
                PlatformError::Unauthorized("invalid token".to_string())
            }
            SecurityError::InsufficientPermissions => {
                PlatformError::Forbidden("insufficient permissions".to_string())
            }
            SecurityError::CryptoFailure(msg) => PlatformError::Internal(msg),
        }
    }
}
