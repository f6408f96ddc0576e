use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Sqlite, Transaction};
use tracing::info;

use crate::db::operations::archetype_profiles::{self, BehavioralRecord, SelfReportRecord};
use crate::db::operations::events::{self, EventQuery};
use crate::db::operations::topic_profiles::{self, ProfileFilter};
use crate::db::Database;
use crate::error::EngineError;
use crate::models::{Archetype, ArchetypeProfile, BehavioralSignals, EventType, OceanScores, TopicProfile};
use crate::services::profile_aggregator::{mean, number, round4, SESSION_HISTORY_LIMIT};

pub const QUESTIONNAIRE_ITEMS: usize = 25;
pub const ITEMS_PER_TRAIT: usize = 5;
pub const MIN_HISTORY_DAYS: i64 = 30;
pub const SECONDARY_MIN_SCORE: f64 = 0.3;

const NEUTRAL_SESSION_SIGNAL: f64 = 0.5;

/// Cut-offs on the 1..=5 trait means that count as "high" or "low".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraitThresholds {
    pub high: f64,
    pub low: f64,
}

impl Default for TraitThresholds {
    fn default() -> Self {
        Self { high: 3.5, low: 2.5 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ArchetypeScore {
    pub archetype: Archetype,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfReport {
    pub ocean_scores: OceanScores,
    pub primary: Archetype,
    pub secondary: Option<Archetype>,
    pub confidence: f64,
    pub scores: Vec<ArchetypeScore>,
}

type SelfReportRule = fn(&TraitFlags) -> f64;

const SELF_REPORT_RULES: [(Archetype, SelfReportRule); 5] = [
    (Archetype::MethodicalPlanner, |t| {
        0.4 * t.high(t.ocean.conscientiousness) + 0.3 * t.low(t.ocean.neuroticism) + 0.3 * t.low(t.ocean.openness)
    }),
    (Archetype::DeepDiver, |t| {
        0.4 * t.high(t.ocean.openness) + 0.3 * t.high(t.ocean.conscientiousness) + 0.3 * t.low(t.ocean.extraversion)
    }),
    (Archetype::BroadExplorer, |t| {
        0.4 * t.high(t.ocean.openness) + 0.3 * t.high(t.ocean.extraversion) + 0.3 * t.low(t.ocean.conscientiousness)
    }),
    (Archetype::SocialCollaborator, |t| {
        0.5 * t.high(t.ocean.extraversion) + 0.5 * t.high(t.ocean.agreeableness)
    }),
    (Archetype::AnxiousAchiever, |t| {
        0.5 * t.high(t.ocean.neuroticism) + 0.3 * t.high(t.ocean.conscientiousness) + 0.2 * t.low(t.ocean.extraversion)
    }),
];

struct TraitFlags {
    ocean: OceanScores,
    thresholds: TraitThresholds,
}

impl TraitFlags {
    fn high(&self, value: f64) -> f64 {
        if value >= self.thresholds.high { 1.0 } else { 0.0 }
    }

    fn low(&self, value: f64) -> f64 {
        if value <= self.thresholds.low { 1.0 } else { 0.0 }
    }
}

/// Accepts a JSON array of exactly 25 integer ratings in 1..=5.
pub fn parse_ratings(values: &[Value]) -> Result<Vec<u8>, EngineError> {
    if values.len() != QUESTIONNAIRE_ITEMS {
        return Err(EngineError::validation(format!(
            "questionnaire requires exactly {QUESTIONNAIRE_ITEMS} responses, got {}",
            values.len()
        )));
    }

    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_u64()
                .filter(|r| (1..=5).contains(r))
                .map(|r| r as u8)
                .ok_or_else(|| EngineError::validation(format!("response {} must be an integer from 1 to 5, got {v}", i + 1)))
        })
        .collect()
}

pub fn ocean_scores(ratings: &[u8]) -> Result<OceanScores, EngineError> {
    if ratings.len() != QUESTIONNAIRE_ITEMS {
        return Err(EngineError::validation(format!(
            "questionnaire requires exactly {QUESTIONNAIRE_ITEMS} responses, got {}",
            ratings.len()
        )));
    }
    if let Some(pos) = ratings.iter().position(|r| !(1..=5).contains(r)) {
        return Err(EngineError::validation(format!(
            "response {} must be from 1 to 5, got {}",
            pos + 1,
            ratings[pos]
        )));
    }

    let trait_mean = |group: usize| {
        let items = &ratings[group * ITEMS_PER_TRAIT..(group + 1) * ITEMS_PER_TRAIT];
        items.iter().map(|r| f64::from(*r)).sum::<f64>() / ITEMS_PER_TRAIT as f64
    };

    Ok(OceanScores {
        openness: trait_mean(0),
        conscientiousness: trait_mean(1),
        extraversion: trait_mean(2),
        agreeableness: trait_mean(3),
        neuroticism: trait_mean(4),
    })
}

pub fn classify_self_report(ratings: &[u8], thresholds: TraitThresholds) -> Result<SelfReport, EngineError> {
    let ocean = ocean_scores(ratings)?;
    let flags = TraitFlags { ocean, thresholds };

    let scores: Vec<ArchetypeScore> = SELF_REPORT_RULES
        .iter()
        .map(|(archetype, rule)| ArchetypeScore {
            archetype: *archetype,
            score: round4(rule(&flags)),
        })
        .collect();

    let (primary, secondary) = ranked(&scores);
    let secondary = secondary.filter(|s| s.score > SECONDARY_MIN_SCORE);

    Ok(SelfReport {
        ocean_scores: ocean,
        primary: primary.archetype,
        secondary: secondary.map(|s| s.archetype),
        confidence: primary.score,
        scores,
    })
}

/// Best and runner-up, earlier entries winning ties.
fn ranked(scores: &[ArchetypeScore]) -> (ArchetypeScore, Option<ArchetypeScore>) {
    let argmax = |skip: Option<usize>| {
        scores
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != skip)
            .fold(None, |best: Option<(usize, ArchetypeScore)>, (i, s)| match best {
                Some((_, b)) if b.score >= s.score => best,
                _ => Some((i, *s)),
            })
    };

    match argmax(None) {
        Some((index, primary)) => (primary, argmax(Some(index)).map(|(_, s)| s)),
        None => (
            ArchetypeScore {
                archetype: Archetype::MethodicalPlanner,
                score: 0.0,
            },
            None,
        ),
    }
}

pub async fn submit_questionnaire(
    db: &Database,
    tenant_id: &str,
    student_id: &str,
    ratings: &[u8],
    thresholds: TraitThresholds,
) -> Result<SelfReport, EngineError> {
    if tenant_id.trim().is_empty() || student_id.trim().is_empty() {
        return Err(EngineError::validation("tenantId and studentId are required"));
    }
    let report = classify_self_report(ratings, thresholds)?;

    let mut tx = db.pool().begin().await?;
    archetype_profiles::upsert_self_report(
        &mut *tx,
        tenant_id,
        student_id,
        &SelfReportRecord {
            ocean_scores: report.ocean_scores,
            responses: ratings.to_vec(),
            primary: report.primary,
            secondary: report.secondary,
            confidence: report.confidence,
        },
        Utc::now(),
    )
    .await?;
    sync_layer_comparison(&mut tx, tenant_id, student_id).await?;
    tx.commit().await?;

    info!(
        tenant_id,
        student_id,
        archetype = %report.primary,
        confidence = report.confidence,
        "self-reported archetype recorded"
    );

    Ok(report)
}

pub async fn get_archetype_profile(
    db: &Database,
    tenant_id: &str,
    student_id: &str,
) -> Result<Option<ArchetypeProfile>, EngineError> {
    archetype_profiles::get_archetype_profile(db.pool(), tenant_id, student_id).await
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BehavioralAssessment {
    pub archetype: Archetype,
    pub confidence: f64,
    pub self_reported: Option<Archetype>,
    pub discrepancy: bool,
    pub blind_spots: Vec<String>,
    pub signals: BehavioralSignals,
    pub scores: Vec<ArchetypeScore>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BehavioralOutcome {
    NotYetAvailable {
        #[serde(rename = "daysOfHistory")]
        days_of_history: i64,
    },
    Assessed(BehavioralAssessment),
}

pub async fn recompute_behavioral_archetype(
    db: &Database,
    tenant_id: &str,
    student_id: &str,
) -> Result<BehavioralOutcome, EngineError> {
    recompute_behavioral_archetype_at(db, tenant_id, student_id, Utc::now()).await
}

/// Layer 2: classify from accumulated behavior once the student has enough
/// history, then persist the behavioral column group.
pub async fn recompute_behavioral_archetype_at(
    db: &Database,
    tenant_id: &str,
    student_id: &str,
    now: DateTime<Utc>,
) -> Result<BehavioralOutcome, EngineError> {
    let pool = db.pool();

    let activity = events::student_activity(pool, tenant_id, student_id).await?;
    let days_of_history = activity
        .first_event_at
        .map(|first| (now - first).num_days().max(0))
        .unwrap_or(0);
    if days_of_history < MIN_HISTORY_DAYS {
        return Ok(BehavioralOutcome::NotYetAvailable { days_of_history });
    }

    let profiles = topic_profiles::list_profiles(
        pool,
        tenant_id,
        &ProfileFilter {
            student_id: Some(student_id),
            ..Default::default()
        },
    )
    .await?;

    let sessions = events::query_events(
        pool,
        &EventQuery {
            event_type: Some(EventType::StudySessionEnded),
            limit: SESSION_HISTORY_LIMIT,
            ..EventQuery::new(tenant_id, student_id)
        },
    )
    .await?;
    let session_minutes: Vec<f64> = sessions
        .iter()
        .filter_map(|e| number(&e.payload, "durationMinutes"))
        .filter(|m| *m >= 0.0)
        .collect();

    let ai_interactions = events::count_events(pool, tenant_id, student_id, EventType::AiInteraction).await?;

    let signals = collect_signals(&profiles, &session_minutes, ai_interactions);
    let existing = archetype_profiles::get_archetype_profile(pool, tenant_id, student_id).await?;
    let self_reported = existing.and_then(|p| p.self_reported_archetype);

    let mut assessment = assess_behavior(signals, self_reported);

    let mut tx = pool.begin().await?;
    archetype_profiles::upsert_behavioral(
        &mut *tx,
        tenant_id,
        student_id,
        &BehavioralRecord {
            archetype: assessment.archetype,
            confidence: assessment.confidence,
            signals: assessment.signals.clone(),
            discrepancy: assessment.discrepancy,
            blind_spots: assessment.blind_spots.clone(),
        },
        now,
    )
    .await?;
    // A questionnaire may have landed since the self-report was read.
    if let Some(stored) = sync_layer_comparison(&mut tx, tenant_id, student_id).await? {
        if stored.self_reported_archetype != assessment.self_reported {
            assessment = assess_behavior(assessment.signals, stored.self_reported_archetype);
        }
    }
    tx.commit().await?;

    info!(
        tenant_id,
        student_id,
        archetype = %assessment.archetype,
        confidence = assessment.confidence,
        discrepancy = assessment.discrepancy,
        "behavioral archetype recomputed"
    );

    Ok(BehavioralOutcome::Assessed(assessment))
}

/// Recomputes discrepancy and blind spots from whatever both layers hold now.
/// Returns the profile as read inside the transaction.
async fn sync_layer_comparison(
    tx: &mut Transaction<'_, Sqlite>,
    tenant_id: &str,
    student_id: &str,
) -> Result<Option<ArchetypeProfile>, EngineError> {
    let Some(profile) = archetype_profiles::get_archetype_profile(&mut **tx, tenant_id, student_id).await? else {
        return Ok(None);
    };
    if let Some((discrepancy, spots)) = layer_comparison(&profile) {
        if discrepancy != profile.discrepancy || spots != profile.blind_spots {
            archetype_profiles::update_layer_comparison(&mut **tx, tenant_id, student_id, discrepancy, &spots).await?;
        }
    }
    Ok(Some(profile))
}

/// `(discrepancy, blind_spots)` for a stored profile, `None` until Layer 2 exists.
pub fn layer_comparison(profile: &ArchetypeProfile) -> Option<(bool, Vec<String>)> {
    let behavioral = profile.behavioral_archetype?;
    let signals = profile.behavioral_signals.clone().unwrap_or_default();
    let self_reported = profile.self_reported_archetype;
    Some((
        self_reported.is_some_and(|s| s != behavioral),
        blind_spots(self_reported, behavioral, &signals),
    ))
}

pub fn collect_signals(profiles: &[TopicProfile], session_minutes: &[f64], ai_interactions: i64) -> BehavioralSignals {
    let non_null = |f: fn(&TopicProfile) -> Option<f64>| -> Option<f64> {
        let values: Vec<f64> = profiles.iter().filter_map(f).collect();
        mean(&values).map(round4)
    };

    let consistency: Vec<f64> = profiles.iter().map(|p| p.metrics.consistency_score).collect();
    let masteries: Vec<f64> = profiles.iter().map(|p| p.metrics.mastery_score).collect();

    BehavioralSignals {
        consistency: mean(&consistency).map(round4).unwrap_or(0.0),
        work_break_ratio: non_null(|p| p.metrics.work_break_ratio),
        calibration: non_null(|p| p.metrics.confidence_calibration),
        detrimental_change_rate: non_null(|p| p.metrics.detrimental_change_rate),
        revisit_ratio: non_null(|p| p.metrics.revisit_ratio),
        avg_session_minutes: mean(session_minutes).map(round4),
        mastery_variance: round4(population_variance(&masteries)),
        ai_interaction_count: ai_interactions,
        topic_count: profiles.len() as i64,
    }
}

pub fn population_variance(values: &[f64]) -> f64 {
    match mean(values) {
        Some(m) => values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64,
        None => 0.0,
    }
}

/// Signals mapped onto 0..=1 for the behavioral rule table.
#[derive(Debug, Clone, Copy)]
struct NormalizedSignals {
    consistency: f64,
    session: f64,
    variance: f64,
    ai: f64,
    work_break: f64,
    revisit: f64,
    detrimental: f64,
    breadth: f64,
    under_confidence: f64,
}

impl NormalizedSignals {
    fn from_signals(s: &BehavioralSignals) -> Self {
        Self {
            consistency: s.consistency.clamp(0.0, 1.0),
            session: s
                .avg_session_minutes
                .map(|m| (m / 60.0).min(1.0))
                .unwrap_or(NEUTRAL_SESSION_SIGNAL),
            variance: (s.mastery_variance / 0.0625).min(1.0),
            ai: (s.ai_interaction_count as f64 / 50.0).min(1.0),
            work_break: s.work_break_ratio.map(|r| (r / 4.0).min(1.0)).unwrap_or(0.0),
            revisit: s.revisit_ratio.map(|r| r.min(1.0)).unwrap_or(0.0),
            detrimental: s.detrimental_change_rate.map(|r| (r / 0.5).min(1.0)).unwrap_or(0.0),
            breadth: (s.topic_count as f64 / 10.0).min(1.0),
            under_confidence: s.calibration.map(|c| (-c).max(0.0)).unwrap_or(0.0),
        }
    }
}

type BehaviorRule = fn(&NormalizedSignals) -> f64;

const BEHAVIOR_RULES: [(Archetype, BehaviorRule); 5] = [
    (Archetype::MethodicalPlanner, |n| {
        0.5 * n.consistency + 0.3 * n.work_break + 0.2 * (1.0 - n.revisit)
    }),
    (Archetype::DeepDiver, |n| 0.4 * n.session + 0.3 * n.variance + 0.3 * n.ai),
    (Archetype::BroadExplorer, |n| {
        0.4 * n.breadth + 0.3 * (1.0 - n.variance) + 0.3 * n.revisit
    }),
    (Archetype::SocialCollaborator, |n| 0.6 * n.ai + 0.4 * (1.0 - n.session)),
    (Archetype::AnxiousAchiever, |n| {
        0.4 * n.detrimental + 0.3 * n.under_confidence + 0.3 * n.revisit
    }),
];

pub fn score_behavior(signals: &BehavioralSignals) -> Vec<ArchetypeScore> {
    let normalized = NormalizedSignals::from_signals(signals);
    BEHAVIOR_RULES
        .iter()
        .map(|(archetype, rule)| ArchetypeScore {
            archetype: *archetype,
            score: round4(rule(&normalized)),
        })
        .collect()
}

pub fn assess_behavior(signals: BehavioralSignals, self_reported: Option<Archetype>) -> BehavioralAssessment {
    let scores = score_behavior(&signals);
    let (winner, _) = ranked(&scores);
    let discrepancy = self_reported.is_some_and(|s| s != winner.archetype);
    let blind_spots = blind_spots(self_reported, winner.archetype, &signals);

    BehavioralAssessment {
        archetype: winner.archetype,
        confidence: winner.score,
        self_reported,
        discrepancy,
        blind_spots,
        signals,
        scores,
    }
}

pub fn blind_spots(
    self_reported: Option<Archetype>,
    behavioral: Archetype,
    signals: &BehavioralSignals,
) -> Vec<String> {
    let Some(self_reported) = self_reported else {
        return Vec::new();
    };

    let mut spots = Vec::new();
    if self_reported != behavioral {
        spots.push(format!(
            "You describe yourself as a {self_reported}, but your study behavior looks more like a {behavioral}."
        ));
    }
    if self_reported == Archetype::MethodicalPlanner && signals.consistency < 0.5 {
        spots.push("You see yourself as a planner, yet you studied on fewer than half of your days.".to_string());
    }

    let anxious = self_reported == Archetype::AnxiousAchiever;
    if !anxious && signals.calibration.is_some_and(|c| c < -0.2) {
        spots.push("Your confidence tends to run opposite to your actual results.".to_string());
    }
    if !anxious && signals.detrimental_change_rate.is_some_and(|r| r > 0.3) {
        spots.push("Second-guessing costs you: changed answers are often right-to-wrong.".to_string());
    }
    spots
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ratings(o: u8, c: u8, e: u8, a: u8, n: u8) -> Vec<u8> {
        [o, c, e, a, n]
            .iter()
            .flat_map(|v| std::iter::repeat(*v).take(ITEMS_PER_TRAIT))
            .collect()
    }

    #[test]
    fn conscientious_calm_conventional_is_a_planner() {
        let report = classify_self_report(&ratings(1, 5, 3, 3, 1), TraitThresholds::default()).unwrap();
        assert_eq!(report.primary, Archetype::MethodicalPlanner);
        assert_eq!(report.confidence, 1.0);
        assert_eq!(report.ocean_scores.conscientiousness, 5.0);
        // Runner-up scores 0.3, which does not clear the secondary bar.
        assert_eq!(report.secondary, None);
    }

    #[test]
    fn secondary_requires_score_above_point_three() {
        // High O, high C, low E: Deep Diver 1.0, Anxious Achiever 0.5.
        let report = classify_self_report(&ratings(5, 5, 1, 3, 3), TraitThresholds::default()).unwrap();
        assert_eq!(report.primary, Archetype::DeepDiver);
        assert_eq!(report.secondary, Some(Archetype::AnxiousAchiever));
    }

    #[test]
    fn ties_go_to_table_order() {
        let report = classify_self_report(&ratings(3, 3, 3, 3, 3), TraitThresholds::default()).unwrap();
        assert_eq!(report.primary, Archetype::MethodicalPlanner);
        assert_eq!(report.confidence, 0.0);
    }

    #[test]
    fn questionnaire_shape_is_validated() {
        assert!(ocean_scores(&[3; 24]).unwrap_err().is_validation());
        let mut bad = ratings(3, 3, 3, 3, 3);
        bad[7] = 6;
        assert!(ocean_scores(&bad).unwrap_err().is_validation());
        bad[7] = 0;
        assert!(ocean_scores(&bad).unwrap_err().is_validation());
    }

    #[test]
    fn ratings_must_be_integers() {
        let mut values: Vec<Value> = (0..25).map(|_| json!(3)).collect();
        assert_eq!(parse_ratings(&values).unwrap().len(), 25);
        values[0] = json!(3.5);
        assert!(parse_ratings(&values).unwrap_err().is_validation());
        values[0] = json!("3");
        assert!(parse_ratings(&values).is_err());
    }

    fn signals() -> BehavioralSignals {
        BehavioralSignals {
            consistency: 0.9,
            work_break_ratio: Some(4.0),
            calibration: Some(0.1),
            detrimental_change_rate: Some(0.0),
            revisit_ratio: Some(0.0),
            avg_session_minutes: Some(30.0),
            mastery_variance: 0.01,
            ai_interaction_count: 0,
            topic_count: 2,
        }
    }

    #[test]
    fn steady_schedule_reads_as_planner() {
        let assessment = assess_behavior(signals(), Some(Archetype::MethodicalPlanner));
        assert_eq!(assessment.archetype, Archetype::MethodicalPlanner);
        assert!((assessment.confidence - 0.95).abs() < 1e-9);
        assert!(!assessment.discrepancy);
        assert!(assessment.blind_spots.is_empty());
    }

    #[test]
    fn chatty_short_sessions_read_as_social() {
        let s = BehavioralSignals {
            consistency: 0.2,
            work_break_ratio: None,
            avg_session_minutes: Some(6.0),
            ai_interaction_count: 80,
            ..signals()
        };
        let assessment = assess_behavior(s, None);
        assert_eq!(assessment.archetype, Archetype::SocialCollaborator);
        assert!(!assessment.discrepancy);
        assert!(assessment.blind_spots.is_empty());
    }

    #[test]
    fn blind_spots_are_ordered() {
        let s = BehavioralSignals {
            consistency: 0.3,
            calibration: Some(-0.4),
            detrimental_change_rate: Some(0.5),
            ..signals()
        };
        let spots = blind_spots(Some(Archetype::MethodicalPlanner), Archetype::AnxiousAchiever, &s);
        assert_eq!(spots.len(), 4);
        assert!(spots[0].contains("Methodical Planner"));
        assert!(spots[0].contains("Anxious Achiever"));
        assert!(spots[1].contains("planner"));
        assert!(spots[2].contains("confidence"));
        assert!(spots[3].contains("changed answers"));
    }

    #[test]
    fn anxious_self_report_skips_confidence_spots() {
        let s = BehavioralSignals {
            calibration: Some(-0.4),
            detrimental_change_rate: Some(0.5),
            ..signals()
        };
        let spots = blind_spots(Some(Archetype::AnxiousAchiever), Archetype::AnxiousAchiever, &s);
        assert!(spots.is_empty());
    }

    #[test]
    fn variance_is_population_variance() {
        assert_eq!(population_variance(&[]), 0.0);
        assert!((population_variance(&[0.2, 0.4]) - 0.01).abs() < 1e-12);
    }
}
