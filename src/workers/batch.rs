use std::future::{self, Future};
use std::time::Instant as StdInstant;

use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DEFAULT_BATCH_CONCURRENCY;
use crate::db::operations::events;
use crate::db::Database;
use crate::error::EngineError;
use crate::models::RiskLevel;
use crate::services::archetype::{self, BehavioralOutcome, MIN_HISTORY_DAYS};
use crate::services::profile_aggregator;
use crate::services::risk_report::{self, AtRiskStudent};

/// Bounds for one batch run. Stopping (deadline or cancellation) prevents new
/// keys from starting; keys already running finish.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub concurrency: usize,
    pub deadline: Option<Instant>,
    pub cancel: Option<CancellationToken>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_BATCH_CONCURRENCY,
            deadline: None,
            cancel: None,
        }
    }
}

impl BatchOptions {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    fn should_stop(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub job: &'static str,
    pub tenant_id: String,
    pub succeeded: usize,
    pub failed: Vec<BatchFailure>,
    pub skipped: usize,
    pub duration_ms: u64,
}

/// Per-item result that is not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Done,
    Skipped,
}

/// Runs `work` over `keys` with bounded parallelism. An item failing is
/// logged and recorded; it never aborts the rest of the batch.
pub async fn run_isolated<K, F, Fut>(
    job: &'static str,
    tenant_id: &str,
    keys: Vec<K>,
    options: &BatchOptions,
    label: fn(&K) -> String,
    work: F,
) -> BatchReport
where
    F: Fn(K) -> Fut,
    Fut: Future<Output = Result<ItemOutcome, EngineError>>,
{
    let started = StdInstant::now();
    let total = keys.len();

    let results: Vec<(String, Result<ItemOutcome, EngineError>)> = stream::iter(keys)
        .take_while(|_| future::ready(!options.should_stop()))
        .map(|key| {
            let name = label(&key);
            let fut = work(key);
            async move { (name, fut.await) }
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    let mut report = BatchReport {
        job,
        tenant_id: tenant_id.to_string(),
        succeeded: 0,
        failed: Vec::new(),
        skipped: total - results.len(),
        duration_ms: 0,
    };

    for (key, result) in results {
        match result {
            Ok(ItemOutcome::Done) => report.succeeded += 1,
            Ok(ItemOutcome::Skipped) => report.skipped += 1,
            Err(err) => {
                error!(job, tenant_id, key = %key, error = %err, "batch item failed");
                report.failed.push(BatchFailure {
                    key,
                    error: err.to_string(),
                });
            }
        }
    }
    report.failed.sort_by(|a, b| a.key.cmp(&b.key));
    report.duration_ms = started.elapsed().as_millis() as u64;

    info!(
        job,
        tenant_id,
        succeeded = report.succeeded,
        failed = report.failed.len(),
        skipped = report.skipped,
        duration_ms = report.duration_ms,
        "batch finished"
    );

    report
}

/// Recomputes every (student, subject, topic) that has events.
pub async fn recompute_all_profiles(
    db: &Database,
    tenant_id: &str,
    options: &BatchOptions,
) -> Result<BatchReport, EngineError> {
    let keys = events::distinct_topic_keys(db.pool(), tenant_id).await?;

    Ok(run_isolated(
        "recompute-profiles",
        tenant_id,
        keys,
        options,
        |key| key.to_string(),
        move |key| async move {
            profile_aggregator::recompute_topic_profile(db, &key).await?;
            Ok(ItemOutcome::Done)
        },
    )
    .await)
}

/// Layer 2 for every student with enough history.
pub async fn recompute_all_archetypes(
    db: &Database,
    tenant_id: &str,
    options: &BatchOptions,
) -> Result<BatchReport, EngineError> {
    let cutoff = Utc::now() - Duration::days(MIN_HISTORY_DAYS);
    let students = events::students_with_history_before(db.pool(), tenant_id, cutoff).await?;

    Ok(run_isolated(
        "recompute-archetypes",
        tenant_id,
        students,
        options,
        |student| student.clone(),
        move |student| async move {
            match archetype::recompute_behavioral_archetype(db, tenant_id, &student).await? {
                BehavioralOutcome::Assessed(_) => Ok(ItemOutcome::Done),
                BehavioralOutcome::NotYetAvailable { .. } => Ok(ItemOutcome::Skipped),
            }
        },
    )
    .await)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAlertReport {
    pub tenant_id: String,
    pub students_flagged: usize,
    pub students: Vec<AtRiskStudent>,
}

/// Finds high-risk students and raises a warning per student.
pub async fn assess_risk_and_alert(db: &Database, tenant_id: &str) -> Result<RiskAlertReport, EngineError> {
    let students = risk_report::get_at_risk_students(db, tenant_id, None, RiskLevel::High).await?;

    for student in &students {
        warn!(
            tenant_id,
            student_id = %student.student_id,
            average_mastery = student.average_mastery,
            reasons = %student.reasons.join("; "),
            intervention = ?student.recommended_intervention,
            "student at high risk"
        );
    }
    info!(tenant_id, flagged = students.len(), "risk assessment finished");

    Ok(RiskAlertReport {
        tenant_id: tenant_id.to_string(),
        students_flagged: students.len(),
        students,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_failure_does_not_stop_the_batch() {
        let keys: Vec<u32> = (0..10).collect();
        let report = run_isolated(
            "test",
            "t1",
            keys,
            &BatchOptions::with_concurrency(3),
            |k| k.to_string(),
            |k| async move {
                if k == 4 {
                    Err(EngineError::validation("bad key"))
                } else if k == 7 {
                    Ok(ItemOutcome::Skipped)
                } else {
                    Ok(ItemOutcome::Done)
                }
            },
        )
        .await;

        assert_eq!(report.succeeded, 8);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].key, "4");
    }

    #[tokio::test]
    async fn cancelled_batch_starts_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = BatchOptions {
            cancel: Some(cancel),
            ..BatchOptions::default()
        };

        let report = run_isolated("test", "t1", vec![1, 2, 3], &options, |k: &i32| k.to_string(), |_| async {
            Ok(ItemOutcome::Done)
        })
        .await;

        assert_eq!(report.succeeded, 0);
        assert_eq!(report.skipped, 3);
    }

    #[tokio::test]
    async fn past_deadline_skips_remaining_keys() {
        let options = BatchOptions {
            deadline: Some(Instant::now()),
            ..BatchOptions::default()
        };
        let report = run_isolated("test", "t1", vec![1, 2], &options, |k: &i32| k.to_string(), |_| async {
            Ok(ItemOutcome::Done)
        })
        .await;
        assert_eq!(report.skipped, 2);
        assert!(report.failed.is_empty());
    }
}
