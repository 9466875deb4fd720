use std::collections::HashSet;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SecurityError;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    perms: Vec<String>,
    iat: i64,
    exp: i64,
    jti: String,
}

/// Decoded view of a token.
///
/// `valid` is false for tokens that parse and verify but are expired or
/// whose subject has been revoked; such tokens never pass a permission
/// check.
#[derive(Clone, Debug)]
pub struct TokenInfo {
    pub subject: String,
    pub permissions: HashSet<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub valid: bool,
}

/// Issues and validates platform tokens.
///
/// Tokens are HS256 JWTs signed with the configured secret, so validation
/// needs no state beyond the secret itself. Revocation is the one
/// in-memory exception: a revoked subject's tokens report `valid: false`.
pub struct SecurityManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
    default_ttl: Duration,
    revoked: RwLock<HashSet<String>>,
}

impl SecurityManager {
    pub fn new(secret: &str, default_ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            default_ttl,
            revoked: RwLock::new(HashSet::new()),
        }
    }

    /// Issue a token for `subject` carrying `permissions`, valid for `ttl`
    /// (the configured default when `None`).
    pub fn issue(
        &self,
        subject: &str,
        permissions: impl IntoIterator<Item = String>,
        ttl: Option<Duration>,
    ) -> Result<String, SecurityError> {
        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let claims = Claims {
            sub: subject.to_string(),
            perms: permissions.into_iter().collect(),
            iat: now.timestamp(),
            exp: now.timestamp() + ttl.as_secs() as i64,
            jti: uuid::Uuid::new_v4().to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| SecurityError::InvalidToken(e.to_string()))?;
        debug!(subject, ttl_secs = ttl.as_secs(), "issued token");
        Ok(token)
    }

    /// Validate a token.
    ///
    /// Malformed tokens and bad signatures are errors. A verified token
    /// that is expired or whose subject is revoked comes back with
    /// `valid: false` instead of an error.
    pub fn validate(&self, token: &str) -> Result<TokenInfo, SecurityError> {
        let mut strict = Validation::new(Algorithm::HS256);
        strict.leeway = 0;
        strict.validate_exp = true;

        let (claims, valid) = match decode::<Claims>(token, &self.decoding, &strict) {
            Ok(data) => (data.claims, true),
            Err(err) if matches!(err.kind(), jsonwebtoken::errors::ErrorKind::ExpiredSignature) => {
                // Signature is good; surface the claims with valid=false.
                let mut relaxed = Validation::new(Algorithm::HS256);
                relaxed.leeway = 0;
                relaxed.validate_exp = false;
                let data = decode::<Claims>(token, &self.decoding, &relaxed)
                    .map_err(|e| SecurityError::InvalidToken(e.to_string()))?;
                (data.claims, false)
            }
            Err(err) => {
                warn!(%err, "token validation failed");
                return Err(SecurityError::InvalidToken(err.to_string()));
            }
        };

        let revoked = self
            .revoked
            .read()
            .expect("revocation set poisoned")
            .contains(&claims.sub);
        Ok(TokenInfo {
            permissions: claims.perms.into_iter().collect(),
            issued_at: Utc
                .timestamp_opt(claims.iat, 0)
                .single()
                .unwrap_or_else(Utc::now),
            expires_at: Utc
                .timestamp_opt(claims.exp, 0)
                .single()
                .unwrap_or_else(Utc::now),
            subject: claims.sub,
            valid: valid && !revoked,
        })
    }

    /// Pure set-membership authorization: every required permission must
    /// be present and the token must be valid.
    pub fn check_permissions<'a>(
        &self,
        info: &TokenInfo,
        required: impl IntoIterator<Item = &'a str>,
    ) -> bool {
        info.valid && required.into_iter().all(|p| info.permissions.contains(p))
    }

    /// All tokens of `subject` validate as `valid: false` from now on.
    pub fn revoke_subject(&self, subject: &str) {
        self.revoked
            .write()
            .expect("revocation set poisoned")
            .insert(subject.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SecurityManager {
        SecurityManager::new("unit-test-secret", Duration::from_secs(3600))
    }

    #[test]
    fn issue_validate_roundtrip() {
        let mgr = manager();
        let token = mgr
            .issue("peer-1", ["resources:create".to_string()], None)
            .unwrap();
        let info = mgr.validate(&token).unwrap();
        assert!(info.valid);
        assert_eq!(info.subject, "peer-1");
        assert!(info.permissions.contains("resources:create"));
        assert!(info.expires_at > info.issued_at);
    }

    #[test]
    fn expired_token_reports_invalid_without_error() {
        let mgr = manager();
        let claims = Claims {
            sub: "peer-2".to_string(),
            perms: vec!["resources:create".to_string()],
            iat: Utc::now().timestamp() - 7200,
            exp: Utc::now().timestamp() - 3600,
            jti: "test".to_string(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"unit-test-secret"),
        )
        .unwrap();

        let info = mgr.validate(&token).unwrap();
        assert!(!info.valid);
        assert_eq!(info.subject, "peer-2");
        assert!(!mgr.check_permissions(&info, ["resources:create"]));
    }

    #[test]
    fn wrong_secret_is_an_error() {
        let mgr = manager();
        let other = SecurityManager::new("different-secret", Duration::from_secs(3600));
        let token = other.issue("peer-3", [], None).unwrap();
        assert!(mgr.validate(&token).is_err());
    }

    #[test]
    fn garbage_token_is_an_error() {
        let mgr = manager();
        assert!(mgr.validate("not-a-token").is_err());
    }

    #[test]
    fn revoked_subject_invalidates_existing_tokens() {
        let mgr = manager();
        let token = mgr.issue("peer-4", ["plugins:start".to_string()], None).unwrap();
        assert!(mgr.validate(&token).unwrap().valid);

        mgr.revoke_subject("peer-4");
        let info = mgr.validate(&token).unwrap();
        assert!(!info.valid);
    }

    #[test]
    fn permission_check_is_subset_membership() {
        let mgr = manager();
        let token = mgr
            .issue(
                "peer-5",
                ["resources:create".to_string(), "plugins:start".to_string()],
                None,
            )
            .unwrap();
        let info = mgr.validate(&token).unwrap();
        assert!(mgr.check_permissions(&info, ["resources:create"]));
        assert!(mgr.check_permissions(&info, ["resources:create", "plugins:start"]));
        assert!(!mgr.check_permissions(&info, ["resources:delete"]));
        assert!(mgr.check_permissions(&info, []));
    }
}
