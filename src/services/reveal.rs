use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::operations::archetype_profiles;
use crate::db::Database;
use crate::error::EngineError;
use crate::models::{Archetype, ArchetypeProfile, BehavioralSignals, OceanScores};
use crate::services::llm_provider::LLMError;

pub const MAX_NARRATIVE_CHARS: usize = 2000;
pub const DEFAULT_NARRATIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_NARRATIVE_ATTEMPTS: u32 = 2;

/// Deterministic facts the narrative is written from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealSummary {
    pub student_id: String,
    pub self_reported: Option<Archetype>,
    pub self_reported_secondary: Option<Archetype>,
    pub behavioral: Option<Archetype>,
    pub ocean_scores: Option<OceanScores>,
    pub signals: Option<BehavioralSignals>,
    pub discrepancy: bool,
    pub blind_spots: Vec<String>,
}

impl RevealSummary {
    pub fn from_profile(profile: &ArchetypeProfile) -> Self {
        Self {
            student_id: profile.student_id.clone(),
            self_reported: profile.self_reported_archetype,
            self_reported_secondary: profile.self_reported_secondary,
            behavioral: profile.behavioral_archetype,
            ocean_scores: profile.ocean_scores,
            signals: profile.behavioral_signals.clone(),
            discrepancy: profile.discrepancy,
            blind_spots: profile.blind_spots.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NarrativeError {
    #[error("generator unavailable")]
    Unavailable,
    #[error(transparent)]
    Llm(#[from] LLMError),
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait NarrativeGenerator: Send + Sync {
    async fn generate(&self, summary: &RevealSummary) -> Result<String, NarrativeError>;

    fn is_available(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrativeSource {
    Generated,
    Fallback,
}

impl NarrativeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            NarrativeSource::Generated => "generated",
            NarrativeSource::Fallback => "fallback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "generated" => Some(NarrativeSource::Generated),
            "fallback" => Some(NarrativeSource::Fallback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NarrativeSettings {
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl Default for NarrativeSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_NARRATIVE_TIMEOUT,
            max_attempts: DEFAULT_NARRATIVE_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Narrative {
    pub text: String,
    pub source: NarrativeSource,
    pub attempts: u32,
}

/// generate -> validate -> retry -> fallback. Always yields a narrative.
pub async fn narrate(
    generator: &dyn NarrativeGenerator,
    summary: &RevealSummary,
    settings: NarrativeSettings,
) -> Narrative {
    let mut attempts = 0;

    if generator.is_available() {
        while attempts < settings.max_attempts {
            attempts += 1;
            match tokio::time::timeout(settings.timeout, generator.generate(summary)).await {
                Ok(Ok(text)) => match validate_narrative(&text) {
                    Some(valid) => {
                        return Narrative {
                            text: valid,
                            source: NarrativeSource::Generated,
                            attempts,
                        }
                    }
                    None => warn!(
                        student_id = %summary.student_id,
                        attempt = attempts,
                        chars = text.chars().count(),
                        "narrative rejected by validation"
                    ),
                },
                Ok(Err(err)) => warn!(
                    student_id = %summary.student_id,
                    attempt = attempts,
                    error = %err,
                    "narrative generation failed"
                ),
                Err(_) => warn!(
                    student_id = %summary.student_id,
                    attempt = attempts,
                    timeout_ms = settings.timeout.as_millis() as u64,
                    "narrative generation timed out"
                ),
            }
        }
    }

    Narrative {
        text: fallback_narrative(summary),
        source: NarrativeSource::Fallback,
        attempts,
    }
}

pub fn validate_narrative(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_NARRATIVE_CHARS {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn fallback_narrative(summary: &RevealSummary) -> String {
    let mut text = match (summary.self_reported, summary.behavioral) {
        (Some(own), Some(observed)) if own == observed => format!(
            "You describe yourself as a {own}, and your study behavior agrees: you work like a {observed}."
        ),
        (Some(own), Some(observed)) => format!(
            "You describe yourself as a {own}, while your study behavior looks more like a {observed}."
        ),
        (Some(own), None) => format!(
            "You describe yourself as a {own}. Keep studying and we will compare that with how you actually work."
        ),
        (None, Some(observed)) => format!("Your study behavior looks most like a {observed}."),
        (None, None) => "There is not enough information yet to describe your learning style.".to_string(),
    };

    if let Some(secondary) = summary.self_reported_secondary {
        text.push_str(&format!(" You also show traits of a {secondary}."));
    }
    match summary.blind_spots.len() {
        0 => return text,
        1 => text.push_str(" There is one pattern worth a closer look: "),
        n => text.push_str(&format!(" There are {n} patterns worth a closer look: ")),
    }
    text.push_str(&summary.blind_spots.join(" "));
    text
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealOutcome {
    pub narrative: String,
    pub source: NarrativeSource,
    pub generated_at: DateTime<Utc>,
    pub cached: bool,
}

/// Returns the stored reveal while it is newer than both archetype layers,
/// otherwise narrates afresh and stores the result.
pub async fn generate_reveal(
    db: &Database,
    generator: &dyn NarrativeGenerator,
    settings: NarrativeSettings,
    tenant_id: &str,
    student_id: &str,
    force: bool,
) -> Result<RevealOutcome, EngineError> {
    let pool = db.pool();
    let profile = archetype_profiles::get_archetype_profile(pool, tenant_id, student_id)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("archetype profile for student {student_id}")))?;

    if profile.self_reported_archetype.is_none() && profile.behavioral_archetype.is_none() {
        return Err(EngineError::validation(
            "a questionnaire or behavioral assessment is required before a reveal",
        ));
    }

    if !force {
        if let Some(cached) = cached_reveal(&profile) {
            return Ok(cached);
        }
    }

    let summary = RevealSummary::from_profile(&profile);
    let narrative = narrate(generator, &summary, settings).await;
    let now = Utc::now();

    archetype_profiles::save_reveal(pool, tenant_id, student_id, &narrative.text, narrative.source.as_str(), now)
        .await?;

    info!(
        tenant_id,
        student_id,
        source = narrative.source.as_str(),
        attempts = narrative.attempts,
        "reveal narrative stored"
    );

    Ok(RevealOutcome {
        narrative: narrative.text,
        source: narrative.source,
        generated_at: now,
        cached: false,
    })
}

fn cached_reveal(profile: &ArchetypeProfile) -> Option<RevealOutcome> {
    let narrative = profile.reveal_narrative.clone()?;
    let source = profile.reveal_source.as_deref().and_then(NarrativeSource::parse)?;
    let generated_at = profile.reveal_generated_at?;

    let stale = [profile.self_reported_at, profile.behavioral_computed_at]
        .into_iter()
        .flatten()
        .any(|at| at > generated_at);
    if stale {
        return None;
    }

    Some(RevealOutcome {
        narrative,
        source,
        generated_at,
        cached: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        replies: Vec<Result<String, String>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, String>>) -> Self {
            Self {
                replies,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl NarrativeGenerator for Scripted {
        async fn generate(&self, _summary: &RevealSummary) -> Result<String, NarrativeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.replies.get(call).cloned() {
                Some(Ok(text)) => Ok(text),
                Some(Err(msg)) => Err(NarrativeError::Other(msg)),
                None => Err(NarrativeError::Unavailable),
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl NarrativeGenerator for Slow {
        async fn generate(&self, _summary: &RevealSummary) -> Result<String, NarrativeError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("too late".to_string())
        }
    }

    fn summary() -> RevealSummary {
        RevealSummary {
            student_id: "s1".into(),
            self_reported: Some(Archetype::MethodicalPlanner),
            self_reported_secondary: None,
            behavioral: Some(Archetype::BroadExplorer),
            ocean_scores: None,
            signals: None,
            discrepancy: true,
            blind_spots: vec!["Spot one.".into()],
        }
    }

    fn quick() -> NarrativeSettings {
        NarrativeSettings {
            timeout: Duration::from_millis(50),
            max_attempts: 2,
        }
    }

    #[tokio::test]
    async fn first_valid_reply_wins() {
        let generator = Scripted::new(vec![Ok("  A thoughtful reveal.  ".into())]);
        let narrative = narrate(&generator, &summary(), quick()).await;
        assert_eq!(narrative.source, NarrativeSource::Generated);
        assert_eq!(narrative.text, "A thoughtful reveal.");
        assert_eq!(narrative.attempts, 1);
    }

    #[tokio::test]
    async fn invalid_output_is_retried() {
        let generator = Scripted::new(vec![Ok("   ".into()), Ok("Second try.".into())]);
        let narrative = narrate(&generator, &summary(), quick()).await;
        assert_eq!(narrative.source, NarrativeSource::Generated);
        assert_eq!(narrative.text, "Second try.");
        assert_eq!(narrative.attempts, 2);
    }

    #[tokio::test]
    async fn exhausted_attempts_fall_back() {
        let generator = Scripted::new(vec![Err("boom".into()), Ok("x".repeat(MAX_NARRATIVE_CHARS + 1))]);
        let narrative = narrate(&generator, &summary(), quick()).await;
        assert_eq!(narrative.source, NarrativeSource::Fallback);
        assert_eq!(narrative.text, fallback_narrative(&summary()));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_generator_times_out() {
        let narrative = narrate(&Slow, &summary(), quick()).await;
        assert_eq!(narrative.source, NarrativeSource::Fallback);
        assert_eq!(narrative.attempts, 2);
    }

    #[test]
    fn fallback_mentions_both_layers_and_spots() {
        let text = fallback_narrative(&summary());
        assert!(text.contains("Methodical Planner"));
        assert!(text.contains("Broad Explorer"));
        assert!(text.ends_with("Spot one."));
        assert_eq!(text, fallback_narrative(&summary()));
    }

    #[test]
    fn narrative_length_is_bounded() {
        assert!(validate_narrative(&"a".repeat(MAX_NARRATIVE_CHARS)).is_some());
        assert!(validate_narrative(&"a".repeat(MAX_NARRATIVE_CHARS + 1)).is_none());
        assert!(validate_narrative("\n\t ").is_none());
    }
}
