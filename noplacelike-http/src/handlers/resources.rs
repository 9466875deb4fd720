use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;

use noplacelike_core::PlatformError;
use noplacelike_resources::{memory_opener, ResourceDescriptor, ResourceFilter, ResourceReader};

use crate::state::AppState;

/// Provider name for resources created through the HTTP registry.
const API_PROVIDER: &str = "api";

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    provider: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<ResourceDescriptor>> {
    let filter = ResourceFilter {
        kind: query.kind,
        provider: query.provider,
        metadata_keys: Vec::new(),
    };
    Json(state.resources.list(&filter))
}

#[derive(Deserialize)]
pub struct CreateRequest {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: String,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

/// `POST /api/resources` — register an in-memory resource.
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateRequest>,
) -> Result<(StatusCode, Json<ResourceDescriptor>), PlatformError> {
    if request.id.is_empty() {
        return Err(PlatformError::InvalidRequest("id is required".to_string()));
    }
    if request.kind.is_empty() {
        return Err(PlatformError::InvalidRequest("type is required".to_string()));
    }
    let bytes = Bytes::from(request.data.into_bytes());
    let descriptor = ResourceDescriptor {
        id: request.id,
        kind: request.kind,
        metadata: request.metadata,
        size: Some(bytes.len() as u64),
    };
    state
        .resources
        .register(descriptor.clone(), API_PROVIDER, memory_opener(bytes))?;
    Ok((StatusCode::CREATED, Json(descriptor)))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResourceDescriptor>, PlatformError> {
    state
        .resources
        .get(&id)
        .map(Json)
        .ok_or_else(|| PlatformError::NotFound(format!("resource {id} not found")))
}

/// `DELETE /api/resources/{id}` — idempotent.
pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.resources.unregister(&id);
    StatusCode::NO_CONTENT
}

/// Closes the provider-side cursor even when the client disconnects
/// mid-stream.
struct ReaderGuard {
    reader: Option<Box<dyn ResourceReader>>,
}

impl ReaderGuard {
    fn close(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// `GET /api/resources/{id}/stream` — chunked transfer of the raw bytes,
/// `Content-Type` taken from descriptor metadata.
pub async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, PlatformError> {
    let descriptor = state
        .resources
        .get(&id)
        .ok_or_else(|| PlatformError::NotFound(format!("resource {id} not found")))?;
    let reader = state.resources.open_stream(&id).await?;
    let content_type = descriptor
        .metadata
        .get("content_type")
        .and_then(|v| v.as_str())
        .unwrap_or("application/octet-stream")
        .to_string();

    let guard = ReaderGuard {
        reader: Some(reader),
    };
    let stream = futures_util::stream::unfold(guard, |mut guard| async move {
        let chunk = match guard.reader.as_mut() {
            Some(reader) => reader.read().await,
            None => return None,
        };
        match chunk {
            Ok(Some(bytes)) => Some((Ok::<_, std::io::Error>(bytes), guard)),
            Ok(None) => {
                guard.close();
                None
            }
            Err(err) => {
                guard.close();
                Some((
                    Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        err.to_string(),
                    )),
                    guard,
                ))
            }
        }
    });

    Ok((
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(stream),
    )
        .into_response())
}
