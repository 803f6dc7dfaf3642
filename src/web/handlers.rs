//! HTTP request handlers.

use super::AppState;
use crate::alarm::event::format_time;
use crate::alarm::{AlarmHistory, AlarmStateStore};
use crate::db::{DbError, NewTarget, TargetPatch};
use crate::metrics::{summarize, target_dimensions, LATENCY, TARGET_NAMESPACE};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;

// ============================================================================
// Errors
// ============================================================================

fn error_response(e: DbError, latency_ms: f64) -> Response {
    let status = match &e {
        DbError::NotFound => StatusCode::NOT_FOUND,
        DbError::Validation(_) => StatusCode::BAD_REQUEST,
        DbError::Conflict => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = match &e {
        DbError::NotFound => "not found".to_string(),
        DbError::Validation(msg) => msg.clone(),
        other => {
            tracing::error!("Request failed: {}", other);
            other.to_string()
        }
    };
    (status, Json(json!({ "error": message, "store_latency_ms": latency_ms }))).into_response()
}

fn elapsed_ms(start: Instant) -> f64 {
    (start.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

pub async fn handle_health(State(state): State<AppState>) -> Response {
    match state.store.get_db_size_bytes() {
        Ok(size) => Json(json!({ "status": "ok", "db_size_bytes": size })).into_response(),
        Err(e) => error_response(e, 0.0),
    }
}

// ============================================================================
// API: Targets
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub active: Option<String>,
}

pub async fn handle_list_targets(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let start = Instant::now();
    let active = query.active.map(|v| v.eq_ignore_ascii_case("true"));

    match state.store.list_targets(active) {
        Ok(items) => Json(json!({
            "count": items.len(),
            "items": items,
            "store_latency_ms": elapsed_ms(start),
        }))
        .into_response(),
        Err(e) => error_response(e, elapsed_ms(start)),
    }
}

pub async fn handle_create_target(
    State(state): State<AppState>,
    Json(req): Json<NewTarget>,
) -> Response {
    let start = Instant::now();

    match state.store.add_target(&req) {
        Ok(item) => {
            tracing::info!(target_id = %item.id, url = %item.url, "Created target");
            (
                StatusCode::CREATED,
                Json(json!({ "item": item, "store_latency_ms": elapsed_ms(start) })),
            )
                .into_response()
        }
        Err(e) => error_response(e, elapsed_ms(start)),
    }
}

pub async fn handle_get_target(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let start = Instant::now();

    match state.store.get_target(&id) {
        Ok(item) => Json(json!({ "item": item, "store_latency_ms": elapsed_ms(start) })).into_response(),
        Err(e) => error_response(e, elapsed_ms(start)),
    }
}

pub async fn handle_update_target(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<TargetPatch>,
) -> Response {
    let start = Instant::now();

    match state.store.update_target(&id, &patch) {
        Ok(item) => {
            tracing::info!(target_id = %item.id, "Updated target");
            Json(json!({ "item": item, "store_latency_ms": elapsed_ms(start) })).into_response()
        }
        Err(e) => error_response(e, elapsed_ms(start)),
    }
}

pub async fn handle_delete_target(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let start = Instant::now();

    match state.store.delete_target(&id) {
        Ok(()) => {
            tracing::info!(target_id = %id, "Deleted target");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(e, elapsed_ms(start)),
    }
}

#[derive(Debug, Deserialize)]
pub struct LatencyQuery {
    #[serde(default)]
    pub minutes: Option<i64>,
}

pub async fn handle_target_latency(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LatencyQuery>,
) -> Response {
    let start = Instant::now();
    let target = match state.store.get_target(&id) {
        Ok(t) => t,
        Err(e) => return error_response(e, elapsed_ms(start)),
    };

    let max_minutes = (state.sample_retention.as_secs() / 60).max(1) as i64;
    let minutes = query.minutes.unwrap_or(60);
    if !(1..=max_minutes).contains(&minutes) {
        let msg = format!("minutes must be between 1 and {}", max_minutes);
        return error_response(DbError::Validation(msg), elapsed_ms(start));
    }

    let end = Utc::now();
    let Some(begin) = ChronoDuration::try_minutes(minutes).and_then(|d| end.checked_sub_signed(d)) else {
        let msg = format!("minutes out of range: {}", minutes);
        return error_response(DbError::Validation(msg), elapsed_ms(start));
    };

    match state.store.get_sample_values(
        TARGET_NAMESPACE,
        LATENCY,
        &target_dimensions(&target.url),
        begin,
        end,
    ) {
        Ok(values) => Json(json!({
            "targetId": target.id,
            "url": target.url,
            "minutes": minutes,
            "summary": summarize(&values),
        }))
        .into_response(),
        Err(e) => error_response(e, elapsed_ms(start)),
    }
}

// ============================================================================
// API: Alarms
// ============================================================================

pub async fn handle_list_alarms(State(state): State<AppState>) -> Response {
    match state.store.list_alarm_states() {
        Ok(states) => Json(json!({ "count": states.len(), "items": states })).into_response(),
        Err(e) => error_response(e, 0.0),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub name: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

fn parse_time(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub async fn handle_alarm_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let end = parse_time(query.end.as_deref()).unwrap_or_else(Utc::now);
    let start = parse_time(query.start.as_deref()).unwrap_or_else(|| end - ChronoDuration::hours(24));

    match state
        .store
        .alarm_events(&query.name, &format_time(start), &format_time(end))
    {
        Ok(events) => Json(json!({ "count": events.len(), "items": events })).into_response(),
        Err(e) => error_response(e, 0.0),
    }
}

#[derive(Debug, Deserialize)]
pub struct NotificationBatch {
    #[serde(default)]
    pub messages: Vec<String>,
}

pub async fn handle_alarm_notifications(
    State(state): State<AppState>,
    Json(batch): Json<NotificationBatch>,
) -> Response {
    if batch.messages.is_empty() {
        tracing::warn!("Alarm notification batch contained no messages; nothing to do");
    }
    let outcome = state.notifier.record_batch(&batch.messages);
    Json(outcome).into_response()
}
