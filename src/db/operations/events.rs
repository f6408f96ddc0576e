use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::error::EngineError;
use crate::models::{from_millis, to_millis, EventType, LearningEvent, Payload, TopicKey};

pub const DEFAULT_QUERY_LIMIT: i64 = 500;
const MS_PER_DAY: i64 = 86_400_000;

const EVENT_COLUMNS: &str = r#""id", "tenantId", "studentId", "eventType", "payload", "subject", "topic", "competencyCode", "occurredAt", "recordedAt""#;

/// Filter for reading a student's event history, newest first.
#[derive(Debug, Clone)]
pub struct EventQuery<'a> {
    pub tenant_id: &'a str,
    pub student_id: &'a str,
    pub subject: Option<&'a str>,
    pub topic: Option<&'a str>,
    pub event_type: Option<EventType>,
    pub since: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl<'a> EventQuery<'a> {
    pub fn new(tenant_id: &'a str, student_id: &'a str) -> Self {
        Self {
            tenant_id,
            student_id,
            subject: None,
            topic: None,
            event_type: None,
            since: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }

    pub fn for_topic(key: &'a TopicKey, event_type: EventType) -> Self {
        Self {
            subject: Some(key.subject.as_str()),
            topic: Some(key.topic.as_str()),
            event_type: Some(event_type),
            ..Self::new(&key.tenant_id, &key.student_id)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StudentActivity {
    pub total_events: i64,
    pub active_days: i64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

pub async fn insert_event(pool: &SqlitePool, event: &LearningEvent) -> Result<(), EngineError> {
    let payload = serde_json::to_string(&event.payload)?;

    sqlx::query(
        r#"
        INSERT INTO "learning_events"
            ("id", "tenantId", "studentId", "eventType", "payload", "subject", "topic", "competencyCode", "occurredAt", "recordedAt")
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.id)
    .bind(&event.tenant_id)
    .bind(&event.student_id)
    .bind(event.event_type.as_str())
    .bind(payload)
    .bind(event.subject.as_deref())
    .bind(event.topic.as_deref())
    .bind(event.competency_code.as_deref())
    .bind(to_millis(event.occurred_at))
    .bind(to_millis(event.recorded_at))
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn query_events(
    pool: &SqlitePool,
    query: &EventQuery<'_>,
) -> Result<Vec<LearningEvent>, EngineError> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        r#"SELECT {EVENT_COLUMNS} FROM "learning_events" WHERE "tenantId" = "#
    ));
    qb.push_bind(query.tenant_id);
    qb.push(r#" AND "studentId" = "#).push_bind(query.student_id);

    if let Some(subject) = query.subject {
        qb.push(r#" AND "subject" = "#).push_bind(subject);
    }
    if let Some(topic) = query.topic {
        qb.push(r#" AND "topic" = "#).push_bind(topic);
    }
    if let Some(event_type) = query.event_type {
        qb.push(r#" AND "eventType" = "#).push_bind(event_type.as_str());
    }
    if let Some(since) = query.since {
        qb.push(r#" AND "occurredAt" >= "#).push_bind(to_millis(since));
    }

    qb.push(r#" ORDER BY "occurredAt" DESC, "recordedAt" DESC, "id" DESC LIMIT "#)
        .push_bind(query.limit.max(0));

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(event_from_row).collect()
}

fn event_from_row(row: &SqliteRow) -> Result<LearningEvent, EngineError> {
    let id: String = row.try_get("id")?;

    let raw_type: String = row.try_get("eventType")?;
    let event_type = raw_type
        .parse::<EventType>()
        .map_err(|reason| EngineError::CorruptRow { id: id.clone(), reason })?;

    let raw_payload: String = row.try_get("payload")?;
    let payload: Payload = serde_json::from_str(&raw_payload).map_err(|e| {
        EngineError::CorruptPayload {
            id: id.clone(),
            reason: e.to_string(),
        }
    })?;

    let occurred_at = timestamp_column(row, "occurredAt", &id)?;
    let recorded_at = timestamp_column(row, "recordedAt", &id)?;

    Ok(LearningEvent {
        tenant_id: row.try_get("tenantId")?,
        student_id: row.try_get("studentId")?,
        event_type,
        payload,
        subject: row.try_get("subject")?,
        topic: row.try_get("topic")?,
        competency_code: row.try_get("competencyCode")?,
        occurred_at,
        recorded_at,
        id,
    })
}

fn timestamp_column(row: &SqliteRow, column: &str, id: &str) -> Result<DateTime<Utc>, EngineError> {
    let ms: i64 = row.try_get(column)?;
    from_millis(ms).ok_or_else(|| EngineError::CorruptRow {
        id: id.to_string(),
        reason: format!("{column} out of range: {ms}"),
    })
}

// Day buckets in SQL floor toward negative infinity, matching `day_index`.
pub async fn student_activity(
    pool: &SqlitePool,
    tenant_id: &str,
    student_id: &str,
) -> Result<StudentActivity, EngineError> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS "total",
               COUNT(DISTINCT (("occurredAt" - ((("occurredAt" % 86400000) + 86400000) % 86400000)) / 86400000)) AS "days",
               MIN("occurredAt") AS "first",
               MAX("occurredAt") AS "last"
        FROM "learning_events"
        WHERE "tenantId" = ? AND "studentId" = ?
        "#,
    )
    .bind(tenant_id)
    .bind(student_id)
    .fetch_one(pool)
    .await?;

    let first: Option<i64> = row.try_get("first")?;
    let last: Option<i64> = row.try_get("last")?;

    Ok(StudentActivity {
        total_events: row.try_get("total")?,
        active_days: row.try_get("days")?,
        first_event_at: first.and_then(from_millis),
        last_event_at: last.and_then(from_millis),
    })
}

/// UTC day indices (days since epoch) on which the student has at least one
/// event at or after `since`, most recent first.
pub async fn active_day_indices(
    pool: &SqlitePool,
    tenant_id: &str,
    student_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<i64>, EngineError> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT (("occurredAt" - ((("occurredAt" % 86400000) + 86400000) % 86400000)) / 86400000) AS "day"
        FROM "learning_events"
        WHERE "tenantId" = ? AND "studentId" = ? AND "occurredAt" >= ?
        ORDER BY "day" DESC
        "#,
    )
    .bind(tenant_id)
    .bind(student_id)
    .bind(to_millis(since))
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| r.try_get::<i64, _>("day").map_err(EngineError::from))
        .collect()
}

pub fn day_index(at: DateTime<Utc>) -> i64 {
    to_millis(at).div_euclid(MS_PER_DAY)
}

pub async fn count_events(
    pool: &SqlitePool,
    tenant_id: &str,
    student_id: &str,
    event_type: EventType,
) -> Result<i64, EngineError> {
    let count: i64 = sqlx::query_scalar(
        r#"SELECT COUNT(*) FROM "learning_events" WHERE "tenantId" = ? AND "studentId" = ? AND "eventType" = ?"#,
    )
    .bind(tenant_id)
    .bind(student_id)
    .bind(event_type.as_str())
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn distinct_topic_keys(pool: &SqlitePool, tenant_id: &str) -> Result<Vec<TopicKey>, EngineError> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT "studentId", "subject", "topic"
        FROM "learning_events"
        WHERE "tenantId" = ? AND "subject" IS NOT NULL AND "topic" IS NOT NULL
        ORDER BY "studentId", "subject", "topic"
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| -> Result<TopicKey, EngineError> {
            Ok(TopicKey {
                tenant_id: tenant_id.to_string(),
                student_id: r.try_get("studentId")?,
                subject: r.try_get("subject")?,
                topic: r.try_get("topic")?,
            })
        })
        .collect()
}

/// Students whose earliest event happened at or before `cutoff`.
pub async fn students_with_history_before(
    pool: &SqlitePool,
    tenant_id: &str,
    cutoff: DateTime<Utc>,
) -> Result<Vec<String>, EngineError> {
    let rows = sqlx::query(
        r#"
        SELECT "studentId"
        FROM "learning_events"
        WHERE "tenantId" = ?
        GROUP BY "studentId"
        HAVING MIN("occurredAt") <= ?
        ORDER BY "studentId"
        "#,
    )
    .bind(tenant_id)
    .bind(to_millis(cutoff))
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| r.try_get::<String, _>("studentId").map_err(EngineError::from))
        .collect()
}

pub async fn distinct_tenants(pool: &SqlitePool) -> Result<Vec<String>, EngineError> {
    let tenants: Vec<String> =
        sqlx::query_scalar(r#"SELECT DISTINCT "tenantId" FROM "learning_events" ORDER BY "tenantId""#)
            .fetch_all(pool)
            .await?;
    Ok(tenants)
}

pub async fn last_event_times(
    pool: &SqlitePool,
    tenant_id: &str,
) -> Result<HashMap<String, DateTime<Utc>>, EngineError> {
    let rows = sqlx::query(
        r#"
        SELECT "studentId", MAX("occurredAt") AS "last"
        FROM "learning_events"
        WHERE "tenantId" = ?
        GROUP BY "studentId"
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;

    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        let student_id: String = row.try_get("studentId")?;
        let last: Option<i64> = row.try_get("last")?;
        if let Some(at) = last.and_then(from_millis) {
            out.insert(student_id, at);
        }
    }
    Ok(out)
}

/// `(active_students, total_events)` in `(start, end]`, so an event at
/// exactly `now` lands in the current week.
pub async fn window_activity(
    pool: &SqlitePool,
    tenant_id: &str,
    subject: Option<&str>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<(i64, i64), EngineError> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        r#"SELECT COUNT(DISTINCT "studentId") AS "students", COUNT(*) AS "events" FROM "learning_events" WHERE "tenantId" = "#,
    );
    qb.push_bind(tenant_id);
    if let Some(subject) = subject {
        qb.push(r#" AND "subject" = "#).push_bind(subject);
    }
    qb.push(r#" AND "occurredAt" > "#).push_bind(to_millis(start));
    qb.push(r#" AND "occurredAt" <= "#).push_bind(to_millis(end));

    let row = qb.build().fetch_one(pool).await?;
    Ok((row.try_get("students")?, row.try_get("events")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_index_is_utc_calendar_day() {
        let morning = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 1).unwrap();
        let night = Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 59).unwrap();
        let next = Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap();
        assert_eq!(day_index(morning), day_index(night));
        assert_eq!(day_index(next), day_index(night) + 1);
    }

    #[test]
    fn topic_query_scopes_to_key() {
        let key = TopicKey::new("t1", "s1", "math", "algebra");
        let q = EventQuery::for_topic(&key, EventType::QuestionAnswered);
        assert_eq!(q.subject, Some("math"));
        assert_eq!(q.topic, Some("algebra"));
        assert_eq!(q.limit, DEFAULT_QUERY_LIMIT);
    }
}
