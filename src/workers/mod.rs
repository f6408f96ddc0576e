pub mod batch;

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::operations::events;
use crate::db::Database;
use crate::error::EngineError;

use self::batch::{BatchFailure, BatchOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledJob {
    RecomputeProfiles,
    AssessRisk,
    RecomputeArchetypes,
}

impl ScheduledJob {
    pub const ALL: [ScheduledJob; 3] = [
        ScheduledJob::RecomputeProfiles,
        ScheduledJob::AssessRisk,
        ScheduledJob::RecomputeArchetypes,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScheduledJob::RecomputeProfiles => "recompute-profiles",
            ScheduledJob::AssessRisk => "assess-risk",
            ScheduledJob::RecomputeArchetypes => "recompute-archetypes",
        }
    }

    fn schedule_env(&self) -> &'static str {
        match self {
            ScheduledJob::RecomputeProfiles => "RECOMPUTE_PROFILES_SCHEDULE",
            ScheduledJob::AssessRisk => "ASSESS_RISK_SCHEDULE",
            ScheduledJob::RecomputeArchetypes => "RECOMPUTE_ARCHETYPES_SCHEDULE",
        }
    }

    /// Nightly, weekly on Monday, monthly on the 1st.
    fn default_schedule(&self) -> &'static str {
        match self {
            ScheduledJob::RecomputeProfiles => "0 0 2 * * *",
            ScheduledJob::AssessRisk => "0 0 6 * * 1",
            ScheduledJob::RecomputeArchetypes => "0 0 3 1 * *",
        }
    }

    pub fn schedule(&self) -> String {
        std::env::var(self.schedule_env())
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.default_schedule().to_string())
    }
}

pub struct WorkerManager {
    scheduler: Mutex<JobScheduler>,
    shutdown: CancellationToken,
    running: AtomicBool,
    db: Database,
    concurrency: usize,
}

impl WorkerManager {
    pub async fn new(db: Database, concurrency: usize) -> Result<Self, WorkerError> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            db,
            concurrency,
        })
    }

    pub async fn start(&self) -> Result<(), WorkerError> {
        let leader = std::env::var("WORKER_LEADER")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        if !leader {
            info!("WORKER_LEADER not set, skipping worker startup");
            return Ok(());
        }

        let tenants = configured_tenants();
        let scheduler = self.scheduler.lock().await;

        for job in ScheduledJob::ALL {
            let schedule = job.schedule();
            let db = self.db.clone();
            let tenants = tenants.clone();
            let shutdown = self.shutdown.clone();
            let concurrency = self.concurrency;

            let cron_job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
                let db = db.clone();
                let tenants = tenants.clone();
                let shutdown = shutdown.clone();
                Box::pin(async move {
                    match run_job(&db, job, tenants, concurrency, shutdown).await {
                        Ok(run) if !run.failed.is_empty() => warn!(
                            job = job.name(),
                            completed = run.completed.len(),
                            failed = run.failed.len(),
                            "scheduled job finished with failed tenants"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(job = job.name(), error = %e, "scheduled job failed"),
                    }
                })
            })?;
            scheduler.add(cron_job).await?;
            info!(job = job.name(), schedule = %schedule, "worker scheduled");
        }

        scheduler.start().await?;
        self.running.store(true, Ordering::Relaxed);
        info!("All workers started");
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }

        info!("Stopping workers...");
        self.shutdown.cancel();

        let mut scheduler = self.scheduler.lock().await;
        if let Err(e) = scheduler.shutdown().await {
            warn!(error = %e, "Error shutting down scheduler");
        }
        info!("Workers stopped");
    }
}

/// Tenants a job run reached, split by outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub job: &'static str,
    pub completed: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

/// Runs one job over every tenant. A failing tenant is logged and the run
/// moves on. Cancellation stops new tenants and new keys; work already
/// running completes.
pub async fn run_job(
    db: &Database,
    job: ScheduledJob,
    tenants: Option<Vec<String>>,
    concurrency: usize,
    shutdown: CancellationToken,
) -> Result<JobRun, WorkerError> {
    let tenants = match tenants {
        Some(list) => list,
        None => events::distinct_tenants(db.pool()).await?,
    };

    let mut run = JobRun {
        job: job.name(),
        completed: Vec::new(),
        failed: Vec::new(),
    };

    for tenant in tenants {
        if shutdown.is_cancelled() {
            info!(job = job.name(), "shutdown requested, remaining tenants skipped");
            break;
        }

        let options = BatchOptions {
            concurrency,
            deadline: None,
            cancel: Some(shutdown.clone()),
        };
        let result = match job {
            ScheduledJob::RecomputeProfiles => batch::recompute_all_profiles(db, &tenant, &options).await.map(drop),
            ScheduledJob::RecomputeArchetypes => {
                batch::recompute_all_archetypes(db, &tenant, &options).await.map(drop)
            }
            ScheduledJob::AssessRisk => batch::assess_risk_and_alert(db, &tenant).await.map(drop),
        };

        match result {
            Ok(()) => run.completed.push(tenant),
            Err(e) => {
                error!(job = job.name(), tenant_id = %tenant, error = %e, "job failed for tenant");
                run.failed.push(BatchFailure {
                    key: tenant,
                    error: e.to_string(),
                });
            }
        }
    }
    Ok(run)
}

fn configured_tenants() -> Option<Vec<String>> {
    let raw = std::env::var("WORKER_TENANTS").ok()?;
    let tenants: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    (!tenants.is_empty()).then_some(tenants)
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}
