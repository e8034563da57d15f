//! HTTP server for nodedashd

use crate::hub::EventHub;
use crate::lifecycle::ShutdownSignal;
use crate::routes;
use crate::state::{AppState, AppStateArc};
use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// No endpoint takes a meaningful request body
const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn router(state: AppStateArc) -> Router {
    Router::new()
        .merge(routes::health_routes())
        .merge(routes::status_routes())
        .merge(routes::update_routes())
        .merge(routes::operation_routes())
        .merge(routes::event_routes())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
}

/// Serve until `shutdown` fires
pub async fn run(state: AppState, bind: &str, shutdown: ShutdownSignal) -> Result<()> {
    let app = router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.recv())
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

/// Keep idle event streams alive. Heartbeats go to every topic that has
/// subscribers and never evict.
pub fn spawn_heartbeat(
    hub: Arc<EventHub>,
    every: Duration,
    mut shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick is immediate; nobody is subscribed yet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    for topic in hub.topics().await {
                        hub.heartbeat(&topic).await;
                    }
                }
            }
        }
        debug!("Heartbeat ticker stopped");
    })
}
