//! HTTP request handlers.

use super::AppState;
use crate::db::{run_blocking, DbError, Store};
use crate::scheduler::CycleReport;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// History entries shown alongside each target in listings.
const LISTING_HISTORY: usize = 10;
const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn db_error_response(e: DbError) -> Response {
    match e {
        DbError::NotFound => error_response(StatusCode::NOT_FOUND, "Target not found"),
        DbError::Invalid(_) | DbError::LimitReached(_) | DbError::Duplicate => {
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        other => {
            tracing::error!("Store error: {}", other);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

/// Run a store call on the blocking pool.
async fn with_store<T, F>(state: &AppState, f: F) -> Result<T, DbError>
where
    F: FnOnce(&Store) -> Result<T, DbError> + Send + 'static,
    T: Send + 'static,
{
    let store = state.store.clone();
    run_blocking(move || f(&store)).await
}

// ============================================================================
// Cycle trigger
// ============================================================================

#[derive(Debug, Serialize)]
struct PingResponse {
    success: bool,
    #[serde(flatten)]
    report: CycleReport,
}

/// Run exactly one ping cycle and summarize it.
pub async fn handle_ping(State(state): State<AppState>) -> Response {
    match state.orchestrator.run_ping_cycle().await {
        Ok(report) => Json(PingResponse { success: true, report }).into_response(),
        Err(e) => {
            tracing::error!("Ping cycle failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub async fn handle_last_cycle(State(state): State<AppState>) -> Response {
    match with_store(&state, |store| store.last_cycle()).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => db_error_response(e),
    }
}

// ============================================================================
// API: Targets
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub owner_id: Option<String>,
}

pub async fn handle_get_targets(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> Response {
    let Some(owner_id) = query.owner_id.filter(|o| !o.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "owner_id is required");
    };

    match with_store(&state, move |store| store.get_targets_for_owner(&owner_id, LISTING_HISTORY)).await {
        Ok(targets) => Json(targets).into_response(),
        Err(e) => db_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTargetRequest {
    pub owner_id: String,
    pub url: String,
}

pub async fn handle_create_target(
    State(state): State<AppState>,
    Json(req): Json<CreateTargetRequest>,
) -> Response {
    let limit = state.config.max_targets_per_owner;
    match with_store(&state, move |store| store.register_target(&req.owner_id, &req.url, limit)).await {
        Ok(target) => {
            tracing::info!(target_id = target.id, url = %target.url, "Registered target");
            (StatusCode::CREATED, Json(target)).into_response()
        }
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_delete_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<OwnerQuery>,
) -> Response {
    let result = with_store(&state, move |store| match query.owner_id.as_deref() {
        Some(owner_id) => store.delete_owned_target(id, owner_id),
        None => store.delete_target(id),
    })
    .await;

    match result {
        Ok(()) => {
            tracing::info!(target_id = id, "Deleted target");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => db_error_response(e),
    }
}

// ============================================================================
// API: History
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn handle_get_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let result = with_store(&state, move |store| {
        store.get_target(id)?;
        store.get_history(id, limit)
    })
    .await;

    match result {
        Ok(history) => Json(history).into_response(),
        Err(e) => db_error_response(e),
    }
}
