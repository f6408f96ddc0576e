use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use tokio::time::Instant;

use crate::response::{ok, AppError};
use crate::state::AppState;
use crate::workers::batch::{self, BatchOptions};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs/recompute-profiles", post(recompute_profiles))
        .route("/jobs/recompute-archetypes", post(recompute_archetypes))
        .route("/jobs/assess-risk", post(assess_risk))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchQuery {
    concurrency: Option<usize>,
    deadline_ms: Option<u64>,
}

impl BatchQuery {
    fn options(&self, state: &AppState) -> BatchOptions {
        BatchOptions {
            concurrency: self
                .concurrency
                .filter(|n| *n > 0)
                .unwrap_or(state.settings().batch_concurrency),
            deadline: self.deadline_ms.map(|ms| Instant::now() + Duration::from_millis(ms)),
            cancel: None,
        }
    }
}

async fn recompute_profiles(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(query): Query<BatchQuery>,
) -> Result<impl IntoResponse, AppError> {
    let report = batch::recompute_all_profiles(state.db(), &tenant, &query.options(&state)).await?;
    Ok(ok(report))
}

async fn recompute_archetypes(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(query): Query<BatchQuery>,
) -> Result<impl IntoResponse, AppError> {
    let report = batch::recompute_all_archetypes(state.db(), &tenant, &query.options(&state)).await?;
    Ok(ok(report))
}

async fn assess_risk(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let report = batch::assess_risk_and_alert(state.db(), &tenant).await?;
    Ok(ok(report))
}
