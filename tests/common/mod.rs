#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;

use learning_analytics::config::AnalyticsSettings;
use learning_analytics::db::config::DbConfig;
use learning_analytics::db::Database;
use learning_analytics::services::events::{capture_event_at, CaptureEventRequest};
use learning_analytics::services::reveal::{NarrativeError, NarrativeGenerator, RevealSummary};
use learning_analytics::state::AppState;

pub const TENANT: &str = "school-1";

/// Database in a fresh temp directory. Keep the `TempDir` alive for the test.
pub async fn test_db() -> (Database, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::connect(DbConfig::for_path(dir.path().join("analytics.db")))
        .await
        .unwrap();
    (db, dir)
}

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap()
}

pub fn answer_payload(correct: bool, time_ms: u64) -> Value {
    json!({
        "questionId": "q",
        "selected": if correct { "A" } else { "B" },
        "correctAnswer": "A",
        "timeTakenMs": time_ms,
    })
}

pub fn request(student: &str, event_type: &str, payload: Value, subject: Option<&str>, topic: Option<&str>) -> CaptureEventRequest {
    serde_json::from_value(json!({
        "studentId": student,
        "eventType": event_type,
        "payload": payload,
        "subject": subject,
        "topic": topic,
    }))
    .unwrap()
}

/// Captures `total` answers, wrong ones first, all at `now`.
pub async fn capture_answers(
    db: &Database,
    student: &str,
    subject: &str,
    topic: &str,
    total: usize,
    correct: usize,
    time_ms: u64,
    now: DateTime<Utc>,
) {
    for i in 0..total {
        let req = request(
            student,
            "question_answered",
            answer_payload(i >= total - correct, time_ms),
            Some(subject),
            Some(topic),
        );
        capture_event_at(db, TENANT, req, now).await.unwrap();
    }
}

/// Generator that returns a fixed text and counts calls.
pub struct FixedNarrator {
    pub text: String,
    pub calls: std::sync::atomic::AtomicU32,
}

impl FixedNarrator {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl NarrativeGenerator for FixedNarrator {
    async fn generate(&self, _summary: &RevealSummary) -> Result<String, NarrativeError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.text.clone())
    }
}

/// Generator that is never configured.
pub struct OfflineNarrator;

#[async_trait]
impl NarrativeGenerator for OfflineNarrator {
    async fn generate(&self, _summary: &RevealSummary) -> Result<String, NarrativeError> {
        Err(NarrativeError::Unavailable)
    }

    fn is_available(&self) -> bool {
        false
    }
}

pub async fn create_test_app() -> (Router, Database, TempDir) {
    let (db, dir) = test_db().await;
    let state = AppState::new(db.clone(), AnalyticsSettings::default(), Arc::new(OfflineNarrator));
    (learning_analytics::create_app(state), db, dir)
}
