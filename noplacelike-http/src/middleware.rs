//! Middleware chain pieces for the front door.
//!
//! Order on the wire: panic recovery, access log + metrics, CORS, body
//! size cap, security headers, rate limit, then per-route auth. Plugin
//! routes are dispatched through the same chain, so contributed handlers
//! cannot bypass it.

use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::extract::Request;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use futures_util::future::Either;
use tower::{Layer, Service};

use noplacelike_core::PlatformError;
use noplacelike_security::{SecurityError, SecurityManager};

/// Pull the bearer token out of the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, SecurityError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(SecurityError::MissingAuthHeader)?;
    let value = value
        .to_str()
        .map_err(|_| SecurityError::InvalidAuthScheme)?;
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().ok_or(SecurityError::InvalidAuthScheme)?;
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return Err(SecurityError::InvalidAuthScheme);
    }
    Ok(token)
}

/// The full auth decision for one request: extract, validate, check the
/// permission set. Returns the documented 401/403 kinds on failure.
pub fn authorize(
    security: &SecurityManager,
    enabled: bool,
    headers: &HeaderMap,
    required: &[&str],
) -> Result<(), PlatformError> {
    if !enabled {
        return Ok(());
    }
    let token = bearer_token(headers).map_err(PlatformError::from)?;
    let info = security.validate(token).map_err(PlatformError::from)?;
    if !info.valid {
        return Err(PlatformError::Unauthorized("invalid token".to_string()));
    }
    if !security.check_permissions(&info, required.iter().copied()) {
        return Err(PlatformError::Forbidden(
            "insufficient permissions".to_string(),
        ));
    }
    Ok(())
}

/// Per-route auth layer. The wrapped handler is never called when the
/// check fails.
#[derive(Clone)]
pub struct RequireAuth {
    security: Arc<SecurityManager>,
    enabled: bool,
    permissions: &'static [&'static str],
}

impl RequireAuth {
    pub fn new(
        security: Arc<SecurityManager>,
        enabled: bool,
        permissions: &'static [&'static str],
    ) -> Self {
        Self {
            security,
            enabled,
            permissions,
        }
    }
}

impl<S> Layer<S> for RequireAuth {
    type Service = RequireAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequireAuthService {
            inner,
            auth: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequireAuthService<S> {
    inner: S,
    auth: RequireAuth,
}

impl<S> Service<Request> for RequireAuthService<S>
where
    S: Service<Request, Response = Response>,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Either<S::Future, Ready<Result<Response, S::Error>>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        match authorize(
            &self.auth.security,
            self.auth.enabled,
            req.headers(),
            self.auth.permissions,
        ) {
            Ok(()) => Either::Left(self.inner.call(req)),
            Err(err) => Either::Right(ready(Ok(err.into_response()))),
        }
    }
}

/// Fixed response headers on every route.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("x-xss-protection", HeaderValue::from_static("0"));
    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    response
}

/// Token-bucket limiter keyed by remote address. Tokens refill at a
/// constant rate; each key gets an independent bucket.
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    max_tokens: f64,
    window: Duration,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Allow `max` requests per `window` per key.
    pub fn new(max: u64, window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            max_tokens: max as f64,
            window,
        }
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: self.max_tokens,
                last_refill: Instant::now(),
            });
        let bucket = entry.value_mut();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        let refill = (elapsed.as_secs_f64() / self.window.as_secs_f64()) * self.max_tokens;
        bucket.tokens = (bucket.tokens + refill).min(self.max_tokens);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub fn rate_limited_response() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        axum::Json(serde_json::json!({ "error": "rate limit exceeded" })),
    )
        .into_response()
}

/// Replace numeric and uuid-shaped path segments so metric label
/// cardinality stays bounded.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.parse::<i64>().is_ok() || looks_like_uuid(segment) {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn looks_like_uuid(s: &str) -> bool {
    s.len() == 36
        && s.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
        && s.matches('-').count() == 4
}
