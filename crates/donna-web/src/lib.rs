//! Axum surface: lifecycle-notification intake and administrative endpoints.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use donna_core::EventNotification;
use donna_sync::{DonnaService, NotificationOutcome, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "donna-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DonnaService>,
}

impl AppState {
    pub fn new(service: Arc<DonnaService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Default, Deserialize)]
struct MappingsQuery {
    guild_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SyncedBody {
    synced: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/notifications", post(notification_handler))
        .route("/admin/sync-events", post(sync_events_handler))
        .route("/admin/cleanup", post(cleanup_handler))
        .route("/admin/mappings", get(mappings_handler))
        .route("/admin/feeds", get(feeds_handler))
        .route("/admin/feeds/refresh", post(refresh_feeds_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(service: Arc<DonnaService>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http surface listening");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn notification_handler(
    State(state): State<Arc<AppState>>,
    Json(notification): Json<EventNotification>,
) -> Response {
    match state.service.handle_notification(&notification).await {
        Ok(NotificationOutcome::Ignored) => Json(json!({ "outcome": "ignored" })).into_response(),
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => sync_error(err, "Failed to process event notification."),
    }
}

async fn sync_events_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.sync_all_events().await {
        Ok(synced) => Json(SyncedBody { synced }).into_response(),
        Err(err) => sync_error(err, "Failed to sync events."),
    }
}

async fn cleanup_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.cleanup().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => sync_error(err, "Failed to clean up calendar."),
    }
}

async fn mappings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MappingsQuery>,
) -> Response {
    match state.service.list_mappings(query.guild_id.as_deref()).await {
        Ok(mappings) => Json(mappings).into_response(),
        Err(err) => sync_error(err, "Failed to list mappings."),
    }
}

async fn feeds_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.list_feeds().await {
        Ok(feeds) => Json(feeds).into_response(),
        Err(err) => sync_error(err, "Failed to list feeds."),
    }
}

async fn refresh_feeds_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.refresh_feeds().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => sync_error(err, "Failed to refresh feeds."),
    }
}

fn sync_error(err: SyncError, message: &str) -> Response {
    if let SyncError::AlreadyRunning(operation) = err {
        warn!(operation, "rejected overlapping run");
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": format!("{operation} is already running.") })),
        )
            .into_response();
    }
    error!(error = %err, "{message}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{message} Check logs for details.") })),
    )
        .into_response()
}
