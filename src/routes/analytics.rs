use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::models::RiskLevel;
use crate::response::{ok, AppError};
use crate::services::risk_report;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/analytics/at-risk", get(at_risk))
        .route("/analytics/department", get(department))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtRiskQuery {
    department: Option<String>,
    risk_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DepartmentQuery {
    department: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

async fn at_risk(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(query): Query<AtRiskQuery>,
) -> Result<impl IntoResponse, AppError> {
    let threshold = match non_blank(&query.risk_level) {
        Some(raw) => RiskLevel::parse(raw)
            .ok_or_else(|| AppError::validation(format!("riskLevel must be low, medium or high, got {raw}")))?,
        None => RiskLevel::Medium,
    };

    let students =
        risk_report::get_at_risk_students(state.db(), &tenant, non_blank(&query.department), threshold).await?;
    Ok(ok(students))
}

async fn department(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(query): Query<DepartmentQuery>,
) -> Result<impl IntoResponse, AppError> {
    let analytics =
        risk_report::get_department_analytics(state.db(), &tenant, non_blank(&query.department)).await?;
    Ok(ok(analytics))
}
