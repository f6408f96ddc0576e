use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::error::EngineError;
use crate::models::{
    from_millis, to_millis, ForgettingCurveParams, RiskLevel, TopicKey, TopicMetrics, TopicProfile,
};

const PROFILE_COLUMNS: &str = r#""id", "tenantId", "studentId", "subject", "topic",
    "questionsAttempted", "questionsCorrect", "accuracy", "avgTimeMs", "timeEfficiency",
    "completionRate", "masteryScore", "confidenceCalibration", "answerChangeRate",
    "beneficialChangeRate", "detrimentalChangeRate", "revisitRatio", "workBreakRatio",
    "consistencyScore", "learningVelocity", "riskLevel", "forgettingCurveParams",
    "lastEventAt", "createdAt", "updatedAt""#;

/// Row filter for tenant-wide profile scans.
#[derive(Debug, Clone, Default)]
pub struct ProfileFilter<'a> {
    pub student_id: Option<&'a str>,
    pub subject: Option<&'a str>,
    pub min_risk: Option<RiskLevel>,
}

pub async fn get_topic_profile(pool: &SqlitePool, key: &TopicKey) -> Result<Option<TopicProfile>, EngineError> {
    let row = sqlx::query(&format!(
        r#"SELECT {PROFILE_COLUMNS} FROM "topic_profiles"
           WHERE "tenantId" = ? AND "studentId" = ? AND "subject" = ? AND "topic" = ? LIMIT 1"#
    ))
    .bind(&key.tenant_id)
    .bind(&key.student_id)
    .bind(&key.subject)
    .bind(&key.topic)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(profile_from_row).transpose()
}

pub async fn list_profiles(
    pool: &SqlitePool,
    tenant_id: &str,
    filter: &ProfileFilter<'_>,
) -> Result<Vec<TopicProfile>, EngineError> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        r#"SELECT {PROFILE_COLUMNS} FROM "topic_profiles" WHERE "tenantId" = "#
    ));
    qb.push_bind(tenant_id);

    if let Some(student_id) = filter.student_id {
        qb.push(r#" AND "studentId" = "#).push_bind(student_id);
    }
    if let Some(subject) = filter.subject {
        qb.push(r#" AND "subject" = "#).push_bind(subject);
    }
    if let Some(min_risk) = filter.min_risk {
        qb.push(r#" AND "riskLevel" IN ("#);
        let mut levels = qb.separated(", ");
        for level in [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High] {
            if level >= min_risk {
                levels.push_bind(level.as_str());
            }
        }
        levels.push_unseparated(")");
    }
    qb.push(r#" ORDER BY "studentId", "subject", "topic""#);

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(profile_from_row).collect()
}

/// Insert-or-update the derived metrics for `key` in one statement. The
/// scheduler-owned `forgettingCurveParams` column is never touched here.
pub async fn upsert_topic_metrics(
    pool: &SqlitePool,
    key: &TopicKey,
    metrics: &TopicMetrics,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now_ms = to_millis(now);

    sqlx::query(
        r#"
        INSERT INTO "topic_profiles" (
            "id", "tenantId", "studentId", "subject", "topic",
            "questionsAttempted", "questionsCorrect", "accuracy", "avgTimeMs", "timeEfficiency",
            "completionRate", "masteryScore", "confidenceCalibration", "answerChangeRate",
            "beneficialChangeRate", "detrimentalChangeRate", "revisitRatio", "workBreakRatio",
            "consistencyScore", "learningVelocity", "riskLevel", "lastEventAt",
            "createdAt", "updatedAt"
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT ("tenantId", "studentId", "subject", "topic") DO UPDATE SET
            "questionsAttempted" = excluded."questionsAttempted",
            "questionsCorrect" = excluded."questionsCorrect",
            "accuracy" = excluded."accuracy",
            "avgTimeMs" = excluded."avgTimeMs",
            "timeEfficiency" = excluded."timeEfficiency",
            "completionRate" = excluded."completionRate",
            "masteryScore" = excluded."masteryScore",
            "confidenceCalibration" = excluded."confidenceCalibration",
            "answerChangeRate" = excluded."answerChangeRate",
            "beneficialChangeRate" = excluded."beneficialChangeRate",
            "detrimentalChangeRate" = excluded."detrimentalChangeRate",
            "revisitRatio" = excluded."revisitRatio",
            "workBreakRatio" = excluded."workBreakRatio",
            "consistencyScore" = excluded."consistencyScore",
            "learningVelocity" = excluded."learningVelocity",
            "riskLevel" = excluded."riskLevel",
            "lastEventAt" = excluded."lastEventAt",
            "updatedAt" = excluded."updatedAt"
        "#,
    )
    .bind(id)
    .bind(&key.tenant_id)
    .bind(&key.student_id)
    .bind(&key.subject)
    .bind(&key.topic)
    .bind(metrics.questions_attempted)
    .bind(metrics.questions_correct)
    .bind(metrics.accuracy)
    .bind(metrics.avg_time_ms)
    .bind(metrics.time_efficiency)
    .bind(metrics.completion_rate)
    .bind(metrics.mastery_score)
    .bind(metrics.confidence_calibration)
    .bind(metrics.answer_change_rate)
    .bind(metrics.beneficial_change_rate)
    .bind(metrics.detrimental_change_rate)
    .bind(metrics.revisit_ratio)
    .bind(metrics.work_break_ratio)
    .bind(metrics.consistency_score)
    .bind(metrics.learning_velocity)
    .bind(metrics.risk_level.as_str())
    .bind(metrics.last_event_at.map(to_millis))
    .bind(now_ms)
    .bind(now_ms)
    .execute(pool)
    .await?;

    Ok(())
}

/// Returns false when no profile row exists for `key`.
pub async fn update_forgetting_params(
    pool: &SqlitePool,
    key: &TopicKey,
    params: &ForgettingCurveParams,
    now: DateTime<Utc>,
) -> Result<bool, EngineError> {
    let encoded = serde_json::to_string(params)?;

    let result = sqlx::query(
        r#"
        UPDATE "topic_profiles"
        SET "forgettingCurveParams" = ?, "updatedAt" = ?
        WHERE "tenantId" = ? AND "studentId" = ? AND "subject" = ? AND "topic" = ?
        "#,
    )
    .bind(encoded)
    .bind(to_millis(now))
    .bind(&key.tenant_id)
    .bind(&key.student_id)
    .bind(&key.subject)
    .bind(&key.topic)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

fn profile_from_row(row: &SqliteRow) -> Result<TopicProfile, EngineError> {
    let id: String = row.try_get("id")?;
    let corrupt = |reason: String| EngineError::CorruptRow { id: id.clone(), reason };

    let raw_risk: String = row.try_get("riskLevel")?;
    let risk_level =
        RiskLevel::parse(&raw_risk).ok_or_else(|| corrupt(format!("unknown risk level {raw_risk}")))?;

    let forgetting_curve_params = match row.try_get::<Option<String>, _>("forgettingCurveParams")? {
        Some(raw) => Some(
            serde_json::from_str::<ForgettingCurveParams>(&raw)
                .map_err(|e| corrupt(format!("forgettingCurveParams: {e}")))?,
        ),
        None => None,
    };

    let created_ms: i64 = row.try_get("createdAt")?;
    let updated_ms: i64 = row.try_get("updatedAt")?;
    let created_at = from_millis(created_ms).ok_or_else(|| corrupt("createdAt out of range".into()))?;
    let updated_at = from_millis(updated_ms).ok_or_else(|| corrupt("updatedAt out of range".into()))?;
    let last_event_at = row.try_get::<Option<i64>, _>("lastEventAt")?.and_then(from_millis);

    let metrics = TopicMetrics {
        questions_attempted: row.try_get("questionsAttempted")?,
        questions_correct: row.try_get("questionsCorrect")?,
        accuracy: row.try_get("accuracy")?,
        avg_time_ms: row.try_get("avgTimeMs")?,
        time_efficiency: row.try_get("timeEfficiency")?,
        completion_rate: row.try_get("completionRate")?,
        mastery_score: row.try_get("masteryScore")?,
        confidence_calibration: row.try_get("confidenceCalibration")?,
        answer_change_rate: row.try_get("answerChangeRate")?,
        beneficial_change_rate: row.try_get("beneficialChangeRate")?,
        detrimental_change_rate: row.try_get("detrimentalChangeRate")?,
        revisit_ratio: row.try_get("revisitRatio")?,
        work_break_ratio: row.try_get("workBreakRatio")?,
        consistency_score: row.try_get("consistencyScore")?,
        learning_velocity: row.try_get("learningVelocity")?,
        risk_level,
        last_event_at,
    };

    Ok(TopicProfile {
        key: TopicKey {
            tenant_id: row.try_get("tenantId")?,
            student_id: row.try_get("studentId")?,
            subject: row.try_get("subject")?,
            topic: row.try_get("topic")?,
        },
        metrics,
        forgetting_curve_params,
        created_at,
        updated_at,
        id,
    })
}
