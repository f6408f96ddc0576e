use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::response::{ok, AppError};
use crate::services::{archetype, reveal, risk_report, spaced_repetition, student_context};
use crate::state::AppState;

use super::parse_json;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/students/:student/summary", get(summary))
        .route("/students/:student/context", get(context))
        .route("/students/:student/reviews/due", get(due_reviews))
        .route("/students/:student/questionnaire", post(questionnaire))
        .route("/students/:student/archetype", get(archetype_profile))
        .route("/students/:student/archetype/behavioral", post(behavioral))
        .route("/students/:student/archetype/reveal", post(reveal_narrative))
}

#[derive(Debug, Default, Deserialize)]
struct ContextQuery {
    subject: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuestionnaireRequest {
    responses: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RevealQuery {
    #[serde(default)]
    force: bool,
}

async fn summary(
    State(state): State<AppState>,
    Path((tenant, student)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let summary = risk_report::get_student_summary(state.db(), &tenant, &student).await?;
    Ok(ok(summary))
}

async fn context(
    State(state): State<AppState>,
    Path((tenant, student)): Path<(String, String)>,
    Query(query): Query<ContextQuery>,
) -> Result<impl IntoResponse, AppError> {
    let subject = query.subject.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let context = student_context::get_student_context(state.db(), &tenant, &student, subject).await?;
    Ok(ok(context))
}

async fn due_reviews(
    State(state): State<AppState>,
    Path((tenant, student)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let due = spaced_repetition::due_reviews(state.db(), &tenant, &student, Utc::now()).await?;
    Ok(ok(due))
}

async fn questionnaire(
    State(state): State<AppState>,
    Path((tenant, student)): Path<(String, String)>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let request: QuestionnaireRequest = parse_json(&body)?;
    let ratings = archetype::parse_ratings(&request.responses)?;
    let report = archetype::submit_questionnaire(
        state.db(),
        &tenant,
        &student,
        &ratings,
        state.settings().trait_thresholds,
    )
    .await?;
    Ok(ok(report))
}

async fn archetype_profile(
    State(state): State<AppState>,
    Path((tenant, student)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let profile = archetype::get_archetype_profile(state.db(), &tenant, &student)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no archetype profile for student {student}")))?;
    Ok(ok(profile))
}

async fn behavioral(
    State(state): State<AppState>,
    Path((tenant, student)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = archetype::recompute_behavioral_archetype(state.db(), &tenant, &student).await?;
    Ok(ok(outcome))
}

async fn reveal_narrative(
    State(state): State<AppState>,
    Path((tenant, student)): Path<(String, String)>,
    Query(query): Query<RevealQuery>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = reveal::generate_reveal(
        state.db(),
        state.narrator(),
        state.settings().narrative,
        &tenant,
        &student,
        query.force,
    )
    .await?;
    Ok(ok(outcome))
}
