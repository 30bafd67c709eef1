//! Cache management routes.
//!
//! - `GET /cache/stats`
//! - `DELETE /cache`
//! - `POST /cache/cleanup`

use axum::extract::State;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use super::AppState;
use super::error::ApiResult;
use crate::cache::{CacheStats, CleanupReport};

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub removed: usize,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/cache", delete(clear_all_cache))
        .route("/cache/stats", get(get_cache_stats))
        .route("/cache/cleanup", post(check_and_cleanup))
}

async fn get_cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

async fn clear_all_cache(State(state): State<AppState>) -> ApiResult<Json<ClearResponse>> {
    let removed = state.cache.clear_all().await?;
    info!(removed, "Cache cleared via API");
    Ok(Json(ClearResponse { removed }))
}

async fn check_and_cleanup(State(state): State<AppState>) -> Json<CleanupReport> {
    Json(state.cache.evict_expired().await)
}
