use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use futures_util::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;

use noplacelike_core::{PlatformError, PlatformEvent};
use noplacelike_events::{EventBus, Owner, SubscriptionId};

use crate::middleware::bearer_token;
use crate::state::AppState;

/// Per-connection buffer between the bus and the SSE writer.
const SSE_BUFFER: usize = 256;

/// Removes the connection's bus subscription when the client goes away.
struct SubscriptionGuard {
    bus: Arc<EventBus>,
    id: SubscriptionId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

/// `GET /api/events/stream` — long-lived `text/event-stream` carrying
/// every bus event as `data: <json>`. Overflowed deliveries surface as a
/// single `: dropped N` comment.
pub async fn stream(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>>, PlatformError> {
    let connection = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<Arc<PlatformEvent>>(SSE_BUFFER);
    let dropped = Arc::new(AtomicU64::new(0));

    let counter = dropped.clone();
    let subscription = state
        .bus
        .subscribe(
            "*",
            Owner::Connection(connection),
            Arc::new(move |event| {
                let tx = tx.clone();
                let counter = counter.clone();
                Box::pin(async move {
                    if tx.try_send(event).is_err() {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                })
            }),
        )
        .map_err(PlatformError::from)?;
    let guard = SubscriptionGuard {
        bus: state.bus.clone(),
        id: subscription,
    };

    let stream = futures_util::stream::unfold(
        (rx, dropped, guard),
        |(mut rx, dropped, guard)| async move {
            let pending = dropped.swap(0, Ordering::Relaxed);
            if pending > 0 {
                let comment = SseEvent::default().comment(format!("dropped {pending}"));
                return Some((Ok(comment), (rx, dropped, guard)));
            }
            match rx.recv().await {
                Some(event) => {
                    let data = serde_json::to_string(&*event).unwrap_or_default();
                    Some((Ok(SseEvent::default().data(data)), (rx, dropped, guard)))
                }
                None => None,
            }
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize)]
pub struct PublishRequest {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// `POST /api/events/publish` — inject an event. Auth is optional: a
/// valid bearer token attributes the event to its subject.
pub async fn publish(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), PlatformError> {
    if request.event_type.is_empty() {
        return Err(PlatformError::InvalidRequest(
            "event type is required".to_string(),
        ));
    }
    let source = bearer_token(&headers)
        .ok()
        .and_then(|token| state.security.validate(token).ok())
        .filter(|info| info.valid)
        .map(|info| info.subject)
        .unwrap_or_else(|| "api".to_string());

    let mut event = PlatformEvent::new(request.event_type, source, request.payload);
    event.metadata = request.metadata;
    let id = event.id.clone();
    state.bus.publish(event).map_err(PlatformError::from)?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "id": id }))))
}
