//! API routes for nodedashd

use crate::hub::{EventHub, Subscriber, SubscriberId};
use crate::state::AppStateArc;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::stream::{self, Stream};
use nodedash_common::{
    HistoryEntry, OperationRecord, Topic, UpdateError, UpdateStatus, VERSION,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info, warn};

type ApiError = (StatusCode, String);

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn resolve(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

fn update_error(e: UpdateError) -> ApiError {
    let code = StatusCode::from_u16(e.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, e.to_string())
}

fn internal(e: anyhow::Error) -> ApiError {
    error!("Request failed: {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
}

fn accepted(message: &str) -> (StatusCode, Json<AcceptedResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            message: message.to_string(),
        }),
    )
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub version: String,
    pub uptime_secs: u64,
    pub subscribers: usize,
}

pub fn health_routes() -> Router<AppStateArc> {
    Router::new().route("/api/health", get(health))
}

async fn health(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    Json(HealthResponse {
        version: VERSION.to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        subscribers: state.hub.subscriber_count().await,
    })
}

// ============================================================================
// Status
// ============================================================================

pub fn status_routes() -> Router<AppStateArc> {
    Router::new().route("/api/status", get(get_status))
}

async fn get_status(State(state): State<AppStateArc>) -> Json<UpdateStatus> {
    Json(state.status.get().await)
}

// ============================================================================
// Self-update
// ============================================================================

pub fn update_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/update/check", post(check_update))
        .route("/api/update/apply", post(apply_update))
        .route("/api/update/restart", post(restart_update))
        .route("/api/update/history", get(update_history))
}

async fn check_update(State(state): State<AppStateArc>) -> Result<Json<UpdateStatus>, ApiError> {
    match state.orchestrator.check_for_updates().await {
        Ok(status) => Ok(Json(status)),
        Err(e) => match e.downcast_ref::<UpdateError>() {
            Some(update) => Err(update_error(update.clone())),
            None => {
                warn!("Update check failed: {:#}", e);
                Err((StatusCode::BAD_GATEWAY, format!("{:#}", e)))
            }
        },
    }
}

async fn apply_update(
    State(state): State<AppStateArc>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    // The run continues detached from this request
    let _run = state.orchestrator.apply_update().map_err(update_error)?;
    info!("Update requested");
    Ok(accepted("Update started"))
}

async fn restart_update(
    State(state): State<AppStateArc>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let _restart = state
        .orchestrator
        .restart_for_update()
        .await
        .map_err(update_error)?;
    info!("Restart for update requested");
    Ok(accepted("Restarting"))
}

async fn update_history(
    State(state): State<AppStateArc>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    state
        .db
        .recent_history(query.resolve())
        .await
        .map(Json)
        .map_err(internal)
}

// ============================================================================
// Operations
// ============================================================================

pub fn operation_routes() -> Router<AppStateArc> {
    Router::new().route("/api/operations", get(list_operations))
}

/// Abandoned records show as failed even before the janitor reaches them
async fn list_operations(
    State(state): State<AppStateArc>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<OperationRecord>>, ApiError> {
    let now = Utc::now();
    let records = state
        .db
        .recent_operations(query.resolve())
        .await
        .map_err(internal)?
        .into_iter()
        .map(|mut record| {
            record.status = record.effective_status(now, state.stale_after);
            record
        })
        .collect();
    Ok(Json(records))
}

// ============================================================================
// Live events
// ============================================================================

pub fn event_routes() -> Router<AppStateArc> {
    Router::new().route("/api/events", get(stream_events))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub topic: Option<String>,
}

/// Unregisters the subscriber when the stream is dropped
struct Registration {
    hub: Arc<EventHub>,
    topic: Topic,
    id: SubscriberId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let hub = Arc::clone(&self.hub);
        let topic = self.topic.clone();
        let id = self.id;
        runtime.spawn(async move {
            hub.unregister(&topic, id).await;
        });
    }
}

async fn stream_events(
    State(state): State<AppStateArc>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let topic = Topic::parse(query.topic.as_deref());
    let (subscriber, mailbox) = Subscriber::new(state.mailbox_capacity);
    let registration = Registration {
        hub: Arc::clone(&state.hub),
        topic: topic.clone(),
        id: subscriber.id(),
    };
    state.hub.register(topic, subscriber).await;

    let events = stream::unfold(
        (mailbox, registration, state.shutdown.signal()),
        |(mut mailbox, registration, mut shutdown)| async move {
            let next = tokio::select! {
                _ = shutdown.wait() => None,
                frame = mailbox.next() => frame,
            };
            let frame = next?;
            let event = Event::default().event(frame.kind).data(&*frame.data);
            Some((Ok::<_, Infallible>(event), (mailbox, registration, shutdown)))
        },
    );
    Sse::new(events)
}
