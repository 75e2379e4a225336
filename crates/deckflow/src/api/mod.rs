use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::api::models::{JobView, MetricsView, ResultItemView};
use crate::jobs::store::JobStore;

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn JobStore>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Inspect
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/results", get(get_results))
        // Metrics
        .route("/metrics", get(metrics))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn internal_err(e: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: format!("internal error: {e}"),
        }),
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "job not found".into(),
        }),
    )
        .into_response()
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn get_job(Path(id): Path<i64>, State(state): State<ApiState>) -> Response {
    match state.store.get(id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(JobView::from(job))).into_response(),
        Ok(None) => not_found(),
        Err(e) => internal_err(e),
    }
}

pub async fn get_results(Path(id): Path<i64>, State(state): State<ApiState>) -> Response {
    match state.store.get(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(),
        Err(e) => return internal_err(e),
    }

    match state.store.results(id).await {
        Ok(items) => {
            let view: Vec<ResultItemView> = items.iter().map(ResultItemView::from).collect();
            (StatusCode::OK, Json(view)).into_response()
        }
        Err(e) => internal_err(e),
    }
}

pub async fn metrics(State(state): State<ApiState>) -> Response {
    match state.store.status_counts().await {
        Ok(status_counts) => {
            let total = status_counts.iter().map(|c| c.count).sum();
            (
                StatusCode::OK,
                Json(MetricsView {
                    status_counts,
                    total,
                }),
            )
                .into_response()
        }
        Err(e) => internal_err(e),
    }
}
