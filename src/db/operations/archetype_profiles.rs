use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool};

use crate::error::EngineError;
use crate::models::{from_millis, to_millis, Archetype, ArchetypeProfile, BehavioralSignals, OceanScores};

/// Layer 1 columns written on questionnaire submission.
#[derive(Debug, Clone)]
pub struct SelfReportRecord {
    pub ocean_scores: OceanScores,
    pub responses: Vec<u8>,
    pub primary: Archetype,
    pub secondary: Option<Archetype>,
    pub confidence: f64,
}

/// Layer 2 columns written on each behavioral recomputation.
#[derive(Debug, Clone)]
pub struct BehavioralRecord {
    pub archetype: Archetype,
    pub confidence: f64,
    pub signals: BehavioralSignals,
    pub discrepancy: bool,
    pub blind_spots: Vec<String>,
}

pub async fn get_archetype_profile<'e, E>(
    executor: E,
    tenant_id: &str,
    student_id: &str,
) -> Result<Option<ArchetypeProfile>, EngineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        r#"
        SELECT "id", "tenantId", "studentId", "oceanScores", "questionnaireResponses",
               "selfReportedArchetype", "selfReportedSecondary", "selfReportedConfidence", "selfReportedAt",
               "behavioralArchetype", "behavioralConfidence", "behavioralSignals", "behavioralComputedAt",
               "discrepancy", "blindSpots", "revealNarrative", "revealSource", "revealGeneratedAt",
               "createdAt", "updatedAt"
        FROM "archetype_profiles"
        WHERE "tenantId" = ? AND "studentId" = ?
        LIMIT 1
        "#,
    )
    .bind(tenant_id)
    .bind(student_id)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(archetype_from_row).transpose()
}

pub async fn upsert_self_report<'e, E>(
    executor: E,
    tenant_id: &str,
    student_id: &str,
    record: &SelfReportRecord,
    now: DateTime<Utc>,
) -> Result<(), EngineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now_ms = to_millis(now);

    sqlx::query(
        r#"
        INSERT INTO "archetype_profiles" (
            "id", "tenantId", "studentId", "oceanScores", "questionnaireResponses",
            "selfReportedArchetype", "selfReportedSecondary", "selfReportedConfidence", "selfReportedAt",
            "createdAt", "updatedAt"
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT ("tenantId", "studentId") DO UPDATE SET
            "oceanScores" = excluded."oceanScores",
            "questionnaireResponses" = excluded."questionnaireResponses",
            "selfReportedArchetype" = excluded."selfReportedArchetype",
            "selfReportedSecondary" = excluded."selfReportedSecondary",
            "selfReportedConfidence" = excluded."selfReportedConfidence",
            "selfReportedAt" = excluded."selfReportedAt",
            "updatedAt" = excluded."updatedAt"
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(tenant_id)
    .bind(student_id)
    .bind(serde_json::to_string(&record.ocean_scores)?)
    .bind(serde_json::to_string(&record.responses)?)
    .bind(record.primary.name())
    .bind(record.secondary.map(|a| a.name()))
    .bind(record.confidence)
    .bind(now_ms)
    .bind(now_ms)
    .bind(now_ms)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn upsert_behavioral<'e, E>(
    executor: E,
    tenant_id: &str,
    student_id: &str,
    record: &BehavioralRecord,
    now: DateTime<Utc>,
) -> Result<(), EngineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now_ms = to_millis(now);

    sqlx::query(
        r#"
        INSERT INTO "archetype_profiles" (
            "id", "tenantId", "studentId", "behavioralArchetype", "behavioralConfidence",
            "behavioralSignals", "behavioralComputedAt", "discrepancy", "blindSpots",
            "createdAt", "updatedAt"
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT ("tenantId", "studentId") DO UPDATE SET
            "behavioralArchetype" = excluded."behavioralArchetype",
            "behavioralConfidence" = excluded."behavioralConfidence",
            "behavioralSignals" = excluded."behavioralSignals",
            "behavioralComputedAt" = excluded."behavioralComputedAt",
            "discrepancy" = excluded."discrepancy",
            "blindSpots" = excluded."blindSpots",
            "updatedAt" = excluded."updatedAt"
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(tenant_id)
    .bind(student_id)
    .bind(record.archetype.name())
    .bind(record.confidence)
    .bind(serde_json::to_string(&record.signals)?)
    .bind(now_ms)
    .bind(record.discrepancy as i64)
    .bind(serde_json::to_string(&record.blind_spots)?)
    .bind(now_ms)
    .bind(now_ms)
    .execute(executor)
    .await?;

    Ok(())
}

/// Rewrites the cross-layer comparison after either layer changed.
pub async fn update_layer_comparison<'e, E>(
    executor: E,
    tenant_id: &str,
    student_id: &str,
    discrepancy: bool,
    blind_spots: &[String],
) -> Result<(), EngineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        UPDATE "archetype_profiles"
        SET "discrepancy" = ?, "blindSpots" = ?
        WHERE "tenantId" = ? AND "studentId" = ?
        "#,
    )
    .bind(discrepancy as i64)
    .bind(serde_json::to_string(blind_spots)?)
    .bind(tenant_id)
    .bind(student_id)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn save_reveal(
    pool: &SqlitePool,
    tenant_id: &str,
    student_id: &str,
    narrative: &str,
    source: &str,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let now_ms = to_millis(now);

    sqlx::query(
        r#"
        INSERT INTO "archetype_profiles" (
            "id", "tenantId", "studentId", "revealNarrative", "revealSource", "revealGeneratedAt",
            "createdAt", "updatedAt"
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT ("tenantId", "studentId") DO UPDATE SET
            "revealNarrative" = excluded."revealNarrative",
            "revealSource" = excluded."revealSource",
            "revealGeneratedAt" = excluded."revealGeneratedAt",
            "updatedAt" = excluded."updatedAt"
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(tenant_id)
    .bind(student_id)
    .bind(narrative)
    .bind(source)
    .bind(now_ms)
    .bind(now_ms)
    .bind(now_ms)
    .execute(pool)
    .await?;

    Ok(())
}

fn archetype_from_row(row: &SqliteRow) -> Result<ArchetypeProfile, EngineError> {
    let id: String = row.try_get("id")?;

    let archetype_column = |column: &str| -> Result<Option<Archetype>, EngineError> {
        match row.try_get::<Option<String>, _>(column)? {
            Some(name) => Archetype::from_name(&name).map(Some).ok_or_else(|| EngineError::CorruptRow {
                id: id.clone(),
                reason: format!("{column}: unknown archetype {name}"),
            }),
            None => Ok(None),
        }
    };
    let self_reported_archetype = archetype_column("selfReportedArchetype")?;
    let self_reported_secondary = archetype_column("selfReportedSecondary")?;
    let behavioral_archetype = archetype_column("behavioralArchetype")?;

    let ocean_scores = json_column::<OceanScores>(row, "oceanScores", &id)?;
    let questionnaire_responses = json_column::<Vec<u8>>(row, "questionnaireResponses", &id)?;
    let behavioral_signals = json_column::<BehavioralSignals>(row, "behavioralSignals", &id)?;
    let blind_spots = json_column::<Vec<String>>(row, "blindSpots", &id)?.unwrap_or_default();

    let optional_time = |column: &str| -> Result<Option<DateTime<Utc>>, EngineError> {
        Ok(row.try_get::<Option<i64>, _>(column)?.and_then(from_millis))
    };
    let created_at = optional_time("createdAt")?.unwrap_or_default();
    let updated_at = optional_time("updatedAt")?.unwrap_or_default();

    Ok(ArchetypeProfile {
        tenant_id: row.try_get("tenantId")?,
        student_id: row.try_get("studentId")?,
        ocean_scores,
        questionnaire_responses,
        self_reported_archetype,
        self_reported_secondary,
        self_reported_confidence: row.try_get("selfReportedConfidence")?,
        self_reported_at: optional_time("selfReportedAt")?,
        behavioral_archetype,
        behavioral_confidence: row.try_get("behavioralConfidence")?,
        behavioral_signals,
        behavioral_computed_at: optional_time("behavioralComputedAt")?,
        discrepancy: row.try_get::<i64, _>("discrepancy")? != 0,
        blind_spots,
        reveal_narrative: row.try_get("revealNarrative")?,
        reveal_source: row.try_get("revealSource")?,
        reveal_generated_at: optional_time("revealGeneratedAt")?,
        created_at,
        updated_at,
        id,
    })
}

fn json_column<T: DeserializeOwned>(row: &SqliteRow, column: &str, id: &str) -> Result<Option<T>, EngineError> {
    match row.try_get::<Option<String>, _>(column)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| EngineError::CorruptRow {
                id: id.to_string(),
                reason: format!("{column}: {e}"),
            }),
        None => Ok(None),
    }
}
