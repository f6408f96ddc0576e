use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::operations::events::{self, EventQuery, DEFAULT_QUERY_LIMIT};
use crate::db::Database;
use crate::error::EngineError;
use crate::models::{EventType, LearningEvent, Payload, TopicKey};
use crate::services::{profile_aggregator, spaced_repetition};

const MAX_QUERY_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEventRequest {
    pub student_id: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    pub subject: Option<String>,
    pub topic: Option<String>,
    pub competency_code: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOutcome {
    pub event_id: String,
    pub profile_recomputed: bool,
    pub review_scheduled: bool,
}

/// Validated, normalized form of a capture request.
#[derive(Debug, Clone)]
struct ValidEvent {
    student_id: String,
    event_type: EventType,
    payload: Payload,
    subject: Option<String>,
    topic: Option<String>,
    competency_code: Option<String>,
}

pub async fn capture_event(
    db: &Database,
    tenant_id: &str,
    request: CaptureEventRequest,
) -> Result<CaptureOutcome, EngineError> {
    capture_event_at(db, tenant_id, request, Utc::now()).await
}

/// Appends the event, then refreshes the affected topic profile. Failures after
/// the append are logged and reported through the outcome flags only.
pub async fn capture_event_at(
    db: &Database,
    tenant_id: &str,
    request: CaptureEventRequest,
    now: DateTime<Utc>,
) -> Result<CaptureOutcome, EngineError> {
    let tenant_id = required(tenant_id, "tenantId")?;
    let occurred_at = request.occurred_at.unwrap_or(now);
    let valid = validate(request)?;

    let event = LearningEvent {
        id: Uuid::new_v4().to_string(),
        tenant_id: tenant_id.to_string(),
        student_id: valid.student_id,
        event_type: valid.event_type,
        payload: valid.payload,
        subject: valid.subject,
        topic: valid.topic,
        competency_code: valid.competency_code,
        occurred_at,
        recorded_at: now,
    };
    events::insert_event(db.pool(), &event).await?;

    debug!(
        event_id = %event.id,
        tenant_id = %event.tenant_id,
        student_id = %event.student_id,
        event_type = %event.event_type,
        "event captured"
    );

    let mut outcome = CaptureOutcome {
        event_id: event.id.clone(),
        profile_recomputed: false,
        review_scheduled: false,
    };

    let (Some(subject), Some(topic)) = (event.subject.as_deref(), event.topic.as_deref()) else {
        return Ok(outcome);
    };
    let key = TopicKey::new(&event.tenant_id, &event.student_id, subject, topic);

    match profile_aggregator::recompute_topic_profile_at(db, &key, now).await {
        Ok(_) => outcome.profile_recomputed = true,
        Err(err) => warn!(key = %key, error = %err, "profile recompute after capture failed"),
    }

    // Scheduling only needs an existing profile row, not a fresh recompute.

    if event.event_type == EventType::FlashcardReviewed && event.payload.contains_key("cardId") {
        match event.payload.get("quality").and_then(spaced_repetition::parse_quality) {
            Some(quality) => match spaced_repetition::record_review_at(db, &key, quality, now).await {
                Ok(scheduled) => outcome.review_scheduled = scheduled.is_some(),
                Err(err) => warn!(key = %key, error = %err, "review scheduling failed"),
            },
            None => warn!(
                key = %key,
                quality = ?event.payload.get("quality"),
                "flashcard review without a usable quality grade"
            ),
        }
    }

    Ok(outcome)
}

fn validate(request: CaptureEventRequest) -> Result<ValidEvent, EngineError> {
    let student_id = required(&request.student_id, "studentId")?.to_string();

    let event_type_raw = required(&request.event_type, "eventType")?;
    let event_type = event_type_raw
        .parse::<EventType>()
        .map_err(EngineError::Validation)?;

    let payload = match request.payload {
        Value::Object(map) => map,
        Value::Null => Payload::new(),
        other => {
            return Err(EngineError::validation(format!(
                "payload must be a JSON object, got {}",
                json_kind(&other)
            )))
        }
    };

    let subject = optional(request.subject);
    let topic = optional(request.topic);
    if topic.is_some() && subject.is_none() {
        return Err(EngineError::validation("topic requires a subject"));
    }

    Ok(ValidEvent {
        student_id,
        event_type,
        payload,
        subject,
        topic,
        competency_code: optional(request.competency_code),
    })
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(EngineError::validation(format!("{field} is required")))
    } else {
        Ok(trimmed)
    }
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    pub subject: Option<String>,
    pub topic: Option<String>,
    pub event_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Read a student's event history, newest first.
pub async fn query_student_events(
    db: &Database,
    tenant_id: &str,
    student_id: &str,
    filter: &EventFilter,
) -> Result<Vec<LearningEvent>, EngineError> {
    let tenant_id = required(tenant_id, "tenantId")?;
    let student_id = required(student_id, "studentId")?;

    let event_type = filter
        .event_type
        .as_deref()
        .map(|raw| raw.parse::<EventType>().map_err(EngineError::Validation))
        .transpose()?;
    let subject = filter.subject.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let topic = filter.topic.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if topic.is_some() && subject.is_none() {
        return Err(EngineError::validation("topic requires a subject"));
    }

    let query = EventQuery {
        subject,
        topic,
        event_type,
        since: filter.since,
        limit: filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT),
        ..EventQuery::new(tenant_id, student_id)
    };

    events::query_events(db.pool(), &query).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(event_type: &str, payload: Value) -> CaptureEventRequest {
        CaptureEventRequest {
            student_id: " s1 ".into(),
            event_type: event_type.into(),
            payload,
            subject: Some("math".into()),
            topic: Some("algebra".into()),
            competency_code: None,
            occurred_at: None,
        }
    }

    #[test]
    fn validation_normalizes_fields() {
        let valid = validate(request("question_answered", json!({"selected": "a"}))).unwrap();
        assert_eq!(valid.student_id, "s1");
        assert_eq!(valid.event_type, EventType::QuestionAnswered);
        assert_eq!(valid.payload.get("selected"), Some(&json!("a")));
    }

    #[test]
    fn null_payload_becomes_empty_object() {
        let valid = validate(request("page_viewed", Value::Null)).unwrap();
        assert!(valid.payload.is_empty());
    }

    #[test]
    fn rejects_non_object_payload() {
        let err = validate(request("page_viewed", json!([1, 2]))).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn rejects_unknown_event_type() {
        assert!(validate(request("quiz_taken", json!({}))).unwrap_err().is_validation());
        assert!(validate(request("  ", json!({}))).unwrap_err().is_validation());
    }

    #[test]
    fn rejects_topic_without_subject() {
        let mut req = request("page_viewed", json!({}));
        req.subject = Some("   ".into());
        assert!(validate(req).unwrap_err().is_validation());
    }

    #[test]
    fn rejects_blank_student() {
        let mut req = request("page_viewed", json!({}));
        req.student_id = String::new();
        assert!(validate(req).unwrap_err().is_validation());
    }
}
