use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::services::archetype::TraitThresholds;
use crate::services::reveal::NarrativeSettings;

pub const DEFAULT_BATCH_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub log_level: String,
    pub analytics: AnalyticsSettings,
}

impl Config {
    pub fn from_env() -> Self {
        let port = env_parse::<u16>("PORT").unwrap_or(3000);

        let host = env_parse::<IpAddr>("HOST").unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));

        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        Self {
            host,
            port,
            log_level,
            analytics: AnalyticsSettings::from_env(),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Tunables for classification, narration and batch jobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyticsSettings {
    pub trait_thresholds: TraitThresholds,
    pub narrative: NarrativeSettings,
    pub batch_concurrency: usize,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            trait_thresholds: TraitThresholds::default(),
            narrative: NarrativeSettings::default(),
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
        }
    }
}

impl AnalyticsSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut trait_thresholds = TraitThresholds {
            high: env_parse("ARCHETYPE_TRAIT_HIGH").unwrap_or(defaults.trait_thresholds.high),
            low: env_parse("ARCHETYPE_TRAIT_LOW").unwrap_or(defaults.trait_thresholds.low),
        };
        if trait_thresholds.low >= trait_thresholds.high {
            tracing::warn!(
                high = trait_thresholds.high,
                low = trait_thresholds.low,
                "archetype trait thresholds overlap, using defaults"
            );
            trait_thresholds = defaults.trait_thresholds;
        }

        let narrative = NarrativeSettings {
            timeout: env_parse::<u64>("NARRATIVE_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.narrative.timeout),
            max_attempts: env_parse::<u32>("NARRATIVE_MAX_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.narrative.max_attempts),
        };

        Self {
            trait_thresholds,
            narrative,
            batch_concurrency: env_parse::<usize>("BATCH_CONCURRENCY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_concurrency),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.trim().parse::<T>().ok())
}
