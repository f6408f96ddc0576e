use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;

use crate::response::{ok, AppError};
use crate::services::events::{self, CaptureEventRequest, EventFilter};
use crate::state::AppState;

use super::parse_json;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/events", post(capture))
        .route("/students/:student/events", get(list))
}

async fn capture(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let request: CaptureEventRequest = parse_json(&body)?;
    let outcome = events::capture_event(state.db(), &tenant, request).await?;
    Ok((StatusCode::CREATED, ok(outcome)))
}

async fn list(
    State(state): State<AppState>,
    Path((tenant, student)): Path<(String, String)>,
    Query(filter): Query<EventFilter>,
) -> Result<impl IntoResponse, AppError> {
    let events = events::query_student_events(state.db(), &tenant, &student, &filter).await?;
    Ok(ok(events))
}
