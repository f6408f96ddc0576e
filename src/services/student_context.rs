use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::operations::{archetype_profiles, topic_profiles};
use crate::db::operations::topic_profiles::ProfileFilter;
use crate::db::Database;
use crate::error::EngineError;
use crate::models::{Archetype, ArchetypeProfile, RiskLevel, TopicProfile};
use crate::services::profile_aggregator::{mean, round4};
use crate::services::spaced_repetition;

pub const WEAK_TOPIC_THRESHOLD: f64 = 0.5;
pub const STRONG_TOPIC_THRESHOLD: f64 = 0.8;
pub const CALIBRATION_BAND: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTendency {
    UnderConfident,
    WellCalibrated,
    OverConfident,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerChangeTendency {
    Beneficial,
    Detrimental,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMastery {
    pub subject: String,
    pub mastery: f64,
    pub topic_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicMastery {
    pub subject: String,
    pub topic: String,
    pub mastery: f64,
}

/// Read-only projection handed to tutoring agents.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAIContext {
    pub student_id: String,
    pub subject: Option<String>,
    pub overall_mastery: f64,
    pub subject_mastery: Vec<SubjectMastery>,
    pub weak_topics: Vec<TopicMastery>,
    pub strong_topics: Vec<TopicMastery>,
    pub confidence_tendency: Option<ConfidenceTendency>,
    pub recommended_difficulty: u8,
    pub answer_change_tendency: Option<AnswerChangeTendency>,
    pub overall_risk: RiskLevel,
    pub self_reported_archetype: Option<Archetype>,
    pub behavioral_archetype: Option<Archetype>,
    pub due_review_count: usize,
}

pub async fn get_student_context(
    db: &Database,
    tenant_id: &str,
    student_id: &str,
    subject: Option<&str>,
) -> Result<StudentAIContext, EngineError> {
    get_student_context_at(db, tenant_id, student_id, subject, Utc::now()).await
}

pub async fn get_student_context_at(
    db: &Database,
    tenant_id: &str,
    student_id: &str,
    subject: Option<&str>,
    now: DateTime<Utc>,
) -> Result<StudentAIContext, EngineError> {
    let pool = db.pool();
    let profiles = topic_profiles::list_profiles(
        pool,
        tenant_id,
        &ProfileFilter {
            student_id: Some(student_id),
            ..Default::default()
        },
    )
    .await?;
    let archetype = archetype_profiles::get_archetype_profile(pool, tenant_id, student_id).await?;
    let due = spaced_repetition::due_reviews(db, tenant_id, student_id, now).await?;

    Ok(build_context(student_id, subject, &profiles, archetype.as_ref(), due.len()))
}

pub fn build_context(
    student_id: &str,
    subject: Option<&str>,
    profiles: &[TopicProfile],
    archetype: Option<&ArchetypeProfile>,
    due_review_count: usize,
) -> StudentAIContext {
    let scoped: Vec<&TopicProfile> = profiles
        .iter()
        .filter(|p| subject.map_or(true, |s| p.key.subject == s))
        .collect();

    let masteries: Vec<f64> = scoped.iter().map(|p| p.metrics.mastery_score).collect();
    let overall_mastery = mean(&masteries).map(round4).unwrap_or(0.0);

    let mut by_subject: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for p in &scoped {
        by_subject.entry(p.key.subject.as_str()).or_default().push(p.metrics.mastery_score);
    }
    let subject_mastery = by_subject
        .into_iter()
        .map(|(subject, values)| SubjectMastery {
            subject: subject.to_string(),
            mastery: mean(&values).map(round4).unwrap_or(0.0),
            topic_count: values.len(),
        })
        .collect();

    let topic = |p: &&TopicProfile| TopicMastery {
        subject: p.key.subject.clone(),
        topic: p.key.topic.clone(),
        mastery: p.metrics.mastery_score,
    };
    let mut weak_topics: Vec<TopicMastery> = scoped
        .iter()
        .filter(|p| p.metrics.mastery_score < WEAK_TOPIC_THRESHOLD)
        .map(topic)
        .collect();
    weak_topics.sort_by(|a, b| a.mastery.total_cmp(&b.mastery));
    let mut strong_topics: Vec<TopicMastery> = scoped
        .iter()
        .filter(|p| p.metrics.mastery_score >= STRONG_TOPIC_THRESHOLD)
        .map(topic)
        .collect();
    strong_topics.sort_by(|a, b| b.mastery.total_cmp(&a.mastery));

    let calibrations: Vec<f64> = scoped.iter().filter_map(|p| p.metrics.confidence_calibration).collect();
    let beneficial: Vec<f64> = scoped.iter().filter_map(|p| p.metrics.beneficial_change_rate).collect();
    let detrimental: Vec<f64> = scoped.iter().filter_map(|p| p.metrics.detrimental_change_rate).collect();

    StudentAIContext {
        student_id: student_id.to_string(),
        subject: subject.map(str::to_string),
        overall_mastery,
        subject_mastery,
        weak_topics,
        strong_topics,
        confidence_tendency: mean(&calibrations).map(confidence_tendency),
        recommended_difficulty: recommended_difficulty(overall_mastery),
        answer_change_tendency: answer_change_tendency(mean(&beneficial), mean(&detrimental)),
        overall_risk: profiles.iter().map(|p| p.metrics.risk_level).max().unwrap_or_default(),
        self_reported_archetype: archetype.and_then(|a| a.self_reported_archetype),
        behavioral_archetype: archetype.and_then(|a| a.behavioral_archetype),
        due_review_count,
    }
}

pub fn confidence_tendency(calibration: f64) -> ConfidenceTendency {
    if calibration < -CALIBRATION_BAND {
        ConfidenceTendency::UnderConfident
    } else if calibration > CALIBRATION_BAND {
        ConfidenceTendency::OverConfident
    } else {
        ConfidenceTendency::WellCalibrated
    }
}

/// Difficulty 1..=5 tracking mastery.
pub fn recommended_difficulty(mastery: f64) -> u8 {
    (mastery * 5.0).round().clamp(1.0, 5.0) as u8
}

pub fn answer_change_tendency(beneficial: Option<f64>, detrimental: Option<f64>) -> Option<AnswerChangeTendency> {
    let (b, d) = match (beneficial, detrimental) {
        (None, None) => return None,
        (b, d) => (b.unwrap_or(0.0), d.unwrap_or(0.0)),
    };
    Some(if b > d {
        AnswerChangeTendency::Beneficial
    } else if d > b {
        AnswerChangeTendency::Detrimental
    } else {
        AnswerChangeTendency::Neutral
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TopicKey, TopicMetrics};

    fn profile(subject: &str, topic: &str, mastery: f64) -> TopicProfile {
        TopicProfile {
            id: format!("{subject}-{topic}"),
            key: TopicKey::new("t1", "s1", subject, topic),
            metrics: TopicMetrics {
                questions_attempted: 20,
                questions_correct: 10,
                accuracy: 0.5,
                avg_time_ms: Some(30_000.0),
                time_efficiency: 1.0,
                completion_rate: 1.0,
                mastery_score: mastery,
                confidence_calibration: None,
                answer_change_rate: None,
                beneficial_change_rate: None,
                detrimental_change_rate: None,
                revisit_ratio: None,
                work_break_ratio: None,
                consistency_score: 0.5,
                learning_velocity: None,
                risk_level: if mastery < 0.3 { RiskLevel::High } else { RiskLevel::Low },
                last_event_at: None,
            },
            forgetting_curve_params: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn weak_and_strong_topics_are_sorted() {
        let profiles = vec![
            profile("math", "algebra", 0.45),
            profile("math", "geometry", 0.2),
            profile("math", "calculus", 0.85),
            profile("physics", "optics", 0.95),
            profile("physics", "waves", 0.6),
        ];
        let ctx = build_context("s1", None, &profiles, None, 2);

        let weak: Vec<&str> = ctx.weak_topics.iter().map(|t| t.topic.as_str()).collect();
        assert_eq!(weak, vec!["geometry", "algebra"]);
        let strong: Vec<&str> = ctx.strong_topics.iter().map(|t| t.topic.as_str()).collect();
        assert_eq!(strong, vec!["optics", "calculus"]);
        assert_eq!(ctx.subject_mastery.len(), 2);
        assert_eq!(ctx.overall_risk, RiskLevel::High);
        assert_eq!(ctx.due_review_count, 2);
        assert_eq!(ctx.recommended_difficulty, 3);
    }

    #[test]
    fn subject_scopes_mastery_but_not_risk() {
        let profiles = vec![profile("math", "geometry", 0.2), profile("physics", "optics", 0.9)];
        let ctx = build_context("s1", Some("physics"), &profiles, None, 0);
        assert_eq!(ctx.overall_mastery, 0.9);
        assert!(ctx.weak_topics.is_empty());
        assert_eq!(ctx.overall_risk, RiskLevel::High);
    }

    #[test]
    fn tendencies_are_null_without_data() {
        let ctx = build_context("s1", None, &[profile("math", "algebra", 0.5)], None, 0);
        assert_eq!(ctx.confidence_tendency, None);
        assert_eq!(ctx.answer_change_tendency, None);
    }

    #[test]
    fn confidence_bands() {
        assert_eq!(confidence_tendency(-0.2), ConfidenceTendency::UnderConfident);
        assert_eq!(confidence_tendency(0.15), ConfidenceTendency::WellCalibrated);
        assert_eq!(confidence_tendency(0.3), ConfidenceTendency::OverConfident);
    }

    #[test]
    fn difficulty_is_clamped() {
        assert_eq!(recommended_difficulty(0.0), 1);
        assert_eq!(recommended_difficulty(0.5), 3);
        assert_eq!(recommended_difficulty(1.0), 5);
    }

    #[test]
    fn change_tendency_compares_rates() {
        assert_eq!(answer_change_tendency(Some(0.6), Some(0.2)), Some(AnswerChangeTendency::Beneficial));
        assert_eq!(answer_change_tendency(Some(0.1), Some(0.5)), Some(AnswerChangeTendency::Detrimental));
        assert_eq!(answer_change_tendency(Some(0.3), Some(0.3)), Some(AnswerChangeTendency::Neutral));
        assert_eq!(answer_change_tendency(None, None), None);
    }
}
