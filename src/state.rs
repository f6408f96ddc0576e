use std::sync::Arc;
use std::time::Instant;

use crate::config::AnalyticsSettings;
use crate::db::Database;
use crate::services::reveal::NarrativeGenerator;

#[derive(Clone)]
pub struct AppState {
    db: Database,
    settings: AnalyticsSettings,
    narrator: Arc<dyn NarrativeGenerator>,
    started_at: Instant,
}

impl AppState {
    pub fn new(db: Database, settings: AnalyticsSettings, narrator: Arc<dyn NarrativeGenerator>) -> Self {
        Self {
            db,
            settings,
            narrator,
            started_at: Instant::now(),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &AnalyticsSettings {
        &self.settings
    }

    pub fn narrator(&self) -> &dyn NarrativeGenerator {
        self.narrator.as_ref()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
