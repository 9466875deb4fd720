//! Dynamic dispatch into plugin-contributed routers.
//!
//! Started plugins sit in the manager's mount table; requests under
//! `/plugins/{name}` are auth-checked against the route's declared
//! requirement and forwarded with the namespace prefix stripped. Stopped
//! and unknown plugins answer 404.

use axum::extract::{Path, Request, State};
use axum::http::Uri;
use axum::response::Response;
use tower::util::ServiceExt;

use noplacelike_core::PlatformError;

use crate::middleware::authorize;
use crate::state::AppState;

pub async fn root(
    State(state): State<AppState>,
    Path(name): Path<String>,
    req: Request,
) -> Result<Response, PlatformError> {
    dispatch(state, name, String::new(), req).await
}

pub async fn sub(
    State(state): State<AppState>,
    Path((name, rest)): Path<(String, String)>,
    req: Request,
) -> Result<Response, PlatformError> {
    dispatch(state, name, rest, req).await
}

async fn dispatch(
    state: AppState,
    name: String,
    rest: String,
    req: Request,
) -> Result<Response, PlatformError> {
    let mount = state
        .plugins
        .mounted(&name)
        .ok_or_else(|| PlatformError::NotFound(format!("plugin {name} is not mounted")))?;

    let inner_path = format!("/{rest}");
    if let Some(auth) = mount.auth_for(req.method(), &inner_path) {
        if auth.required {
            let required: Vec<&str> = auth.permissions.iter().map(|p| p.as_str()).collect();
            authorize(
                &state.security,
                state.config.auth.enabled,
                req.headers(),
                &required,
            )?;
        }
    }

    let (mut parts, body) = req.into_parts();
    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{inner_path}?{query}"),
        None => inner_path,
    };
    let mut uri_parts = parts.uri.clone().into_parts();
    uri_parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|_| PlatformError::InvalidRequest("bad plugin path".to_string()))?,
    );
    parts.uri = Uri::from_parts(uri_parts)
        .map_err(|_| PlatformError::InvalidRequest("bad plugin path".to_string()))?;
    let req = Request::from_parts(parts, body);

    let router = mount.router.clone();
    router
        .oneshot(req)
        .await
        .map_err(|_| PlatformError::Internal("plugin dispatch failed".to_string()))
}
