mod analytics;
mod events;
mod health;
mod jobs;
mod students;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde::de::DeserializeOwned;

use crate::response::{AppError, ErrorResponse};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let tenant_routes = Router::new()
        .merge(events::router())
        .merge(students::router())
        .merge(analytics::router())
        .merge(jobs::router());

    Router::new()
        .nest("/api/tenants/:tenant", tenant_routes)
        .merge(health::router())
        .fallback(fallback_handler)
        .with_state(state)
}

/// Decodes a JSON body, reporting malformed input as a validation error.
fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    let raw: &[u8] = if body.iter().all(u8::is_ascii_whitespace) { b"{}" } else { &body[..] };
    serde_json::from_slice(raw).map_err(|e| AppError::validation(format!("invalid request body: {e}")))
}

async fn fallback_handler() -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(ErrorResponse {
            success: false,
            error: "route not found".to_string(),
            code: "NOT_FOUND".to_string(),
        }),
    )
        .into_response()
}
