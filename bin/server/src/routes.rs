//! HTTP routes over the trigger service.

use crate::error::ApiError;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Duration;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::str::FromStr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use trigger_relay_core::TriggerId;
use trigger_relay_events::{Event, EventStats};
use trigger_relay_scheduler::{TestOutcome, TriggerService};
use trigger_relay_trigger::{NewTrigger, Trigger, TriggerPatch};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    service: TriggerService,
}

/// Builds the API router with request tracing and permissive CORS.
pub fn router(service: TriggerService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/triggers", post(create_trigger).get(list_triggers))
        .route("/api/v1/triggers/test", post(test_trigger))
        .route(
            "/api/v1/triggers/{id}",
            get(get_trigger).put(update_trigger).delete(delete_trigger),
        )
        .route("/api/v1/triggers/{id}/execute", post(execute_trigger))
        .route("/api/v1/events/recent", get(recent_events))
        .route("/api/v1/events/archived", get(archived_events))
        .route("/api/v1/events/stats", get(event_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { service })
}

fn parse_id(raw: &str) -> Result<TriggerId, ApiError> {
    TriggerId::from_str(raw).map_err(ApiError::bad_request)
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    active_only: bool,
}

#[derive(Debug, Default, Deserialize)]
struct WindowParams {
    hours: Option<u32>,
}

impl WindowParams {
    fn window(&self) -> Option<Duration> {
        self.hours.map(|h| Duration::hours(i64::from(h)))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct TestRequest {
    trigger: NewTrigger,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn create_trigger(
    State(state): State<AppState>,
    Json(definition): Json<NewTrigger>,
) -> Result<(StatusCode, Json<Trigger>), ApiError> {
    let trigger = state.service.create_trigger(definition).await?;
    Ok((StatusCode::CREATED, Json(trigger)))
}

async fn list_triggers(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Trigger>>, ApiError> {
    Ok(Json(state.service.list_triggers(params.active_only).await?))
}

async fn test_trigger(
    State(state): State<AppState>,
    Json(request): Json<TestRequest>,
) -> Result<Json<TestOutcome>, ApiError> {
    let outcome = state
        .service
        .test_trigger(request.trigger, request.payload)
        .await?;
    Ok(Json(outcome))
}

async fn get_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Trigger>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.service.get_trigger(id).await?))
}

async fn update_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<TriggerPatch>,
) -> Result<Json<Trigger>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.service.update_trigger(id, patch).await?))
}

async fn delete_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.service.delete_trigger(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The body is optional; an empty body executes with the trigger's defaults.
async fn execute_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Event>, ApiError> {
    let id = parse_id(&id)?;
    let request = if body.is_empty() {
        ExecuteRequest::default()
    } else {
        serde_json::from_slice::<ExecuteRequest>(&body).map_err(ApiError::bad_request)?
    };
    Ok(Json(
        state
            .service
            .execute_trigger_now(id, request.payload)
            .await?,
    ))
}

async fn recent_events(
    State(state): State<AppState>,
    Query(params): Query<WindowParams>,
) -> Result<Json<Vec<Event>>, ApiError> {
    Ok(Json(state.service.get_recent_events(params.window()).await?))
}

async fn archived_events(
    State(state): State<AppState>,
    Query(params): Query<WindowParams>,
) -> Result<Json<Vec<Event>>, ApiError> {
    Ok(Json(
        state.service.get_archived_events(params.window()).await?,
    ))
}

async fn event_stats(
    State(state): State<AppState>,
    Query(params): Query<WindowParams>,
) -> Result<Json<Vec<EventStats>>, ApiError> {
    Ok(Json(state.service.get_event_stats(params.window()).await?))
}
