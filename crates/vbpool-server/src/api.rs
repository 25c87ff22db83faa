use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::state::AppState;
use vbpool_common::types::PoolCounts;
use vbpool_manager::{PoolManager, StatsSnapshot};

#[derive(Serialize)]
pub struct PoolSummary {
    pub pool: String,
    pub counts: PoolCounts,
    pub low_watermark: u64,
    pub high_watermark: u64,
    pub stats: StatsSnapshot,
}

#[derive(Deserialize)]
pub struct AssignRequest {
    pub room_id: String,
    pub uid: String,
}

#[derive(Default, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub uid: Option<String>,
}

fn not_found(pool: &str) -> Response {
    (StatusCode::NOT_FOUND, format!("unknown pool {pool}")).into_response()
}

fn internal(err: anyhow::Error) -> Response {
    tracing::error!(error = %err, "Request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn list_pools(State(state): State<AppState>) -> Response {
    let mut summaries = Vec::with_capacity(state.pools.len());
    for manager in state.pools.values() {
        match summarize(manager).await {
            Ok(summary) => summaries.push(summary),
            Err(e) => return internal(e),
        }
    }
    summaries.sort_by(|a, b| a.pool.cmp(&b.pool));
    Json(summaries).into_response()
}

async fn summarize(manager: &PoolManager) -> anyhow::Result<PoolSummary> {
    let counts = manager.counts().await?;
    let (low_watermark, high_watermark) = manager.buffers();
    Ok(PoolSummary {
        pool: manager.pool_name().to_string(),
        counts,
        low_watermark,
        high_watermark,
        stats: manager.stats(),
    })
}

pub async fn available_vbrowsers(
    State(state): State<AppState>,
    Path(pool): Path<String>,
) -> Response {
    let Some(manager) = state.pool(&pool) else {
        return not_found(&pool);
    };
    match manager.get_available_vbrowsers().await {
        Ok(vmids) => Json(vmids).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn staging_vbrowsers(
    State(state): State<AppState>,
    Path(pool): Path<String>,
) -> Response {
    let Some(manager) = state.pool(&pool) else {
        return not_found(&pool);
    };
    match manager.get_staging_vbrowsers().await {
        Ok(vmids) => Json(vmids).into_response(),
        Err(e) => internal(e),
    }
}

/// Stand-in for the session service: queue the room, run the assignment
/// protocol under the configured timeout, dequeue on the way out. The
/// caller sees a VM or nothing; a timed-out wait and a cancelled room
/// are indistinguishable by design.
pub async fn assign(
    State(state): State<AppState>,
    Path(pool): Path<String>,
    Json(req): Json<AssignRequest>,
) -> Response {
    let Some(manager) = state.pool(&pool) else {
        return not_found(&pool);
    };

    if let Err(e) = state.store.enqueue_room(&req.room_id, Utc::now()).await {
        return internal(e.into());
    }

    let assigned = tokio::time::timeout(
        Duration::from_secs(state.assign_timeout_secs),
        manager.assign_vm(&req.room_id, &req.uid),
    )
    .await
    .ok()
    .flatten();

    if let Err(e) = state.store.dequeue_room(&req.room_id).await {
        tracing::warn!(room_id = %req.room_id, error = %e, "Dequeue after assign failed");
    }

    match assigned {
        Some(vm) => Json(vm).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn reset(
    State(state): State<AppState>,
    Path((pool, vmid)): Path<(String, String)>,
    body: Option<Json<ResetRequest>>,
) -> Response {
    let Some(manager) = state.pool(&pool) else {
        return not_found(&pool);
    };
    let uid = body.and_then(|Json(req)| req.uid);
    manager.reset_vm(&vmid, uid.as_deref()).await;
    StatusCode::NO_CONTENT.into_response()
}

/// Operational snapshot refresh; not on the hot path.
pub async fn update_snapshot(
    State(state): State<AppState>,
    Path(pool): Path<String>,
) -> Response {
    let Some(manager) = state.pool(&pool) else {
        return not_found(&pool);
    };
    match manager.update_snapshot().await {
        Ok(image) => Json(image).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path((pool, vmid)): Path<(String, String)>,
) -> Response {
    let Some(manager) = state.pool(&pool) else {
        return not_found(&pool);
    };
    match manager.record_heartbeat(&vmid).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, "no such lease").into_response(),
        Err(e) => internal(e),
    }
}
