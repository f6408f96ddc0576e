use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub type Payload = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    QuestionAnswered,
    PageViewed,
    FlashcardReviewed,
    StudySessionStarted,
    StudySessionEnded,
    AiInteraction,
    NavigationEvent,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::QuestionAnswered,
        EventType::PageViewed,
        EventType::FlashcardReviewed,
        EventType::StudySessionStarted,
        EventType::StudySessionEnded,
        EventType::AiInteraction,
        EventType::NavigationEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::QuestionAnswered => "question_answered",
            EventType::PageViewed => "page_viewed",
            EventType::FlashcardReviewed => "flashcard_reviewed",
            EventType::StudySessionStarted => "study_session_started",
            EventType::StudySessionEnded => "study_session_ended",
            EventType::AiInteraction => "ai_interaction",
            EventType::NavigationEvent => "navigation_event",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable interaction event as stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningEvent {
    pub id: String,
    pub tenant_id: String,
    pub student_id: String,
    pub event_type: EventType,
    pub payload: Payload,
    pub subject: Option<String>,
    pub topic: Option<String>,
    pub competency_code: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicKey {
    pub tenant_id: String,
    pub student_id: String,
    pub subject: String,
    pub topic: String,
}

impl TopicKey {
    pub fn new(
        tenant_id: impl Into<String>,
        student_id: impl Into<String>,
        subject: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            student_id: student_id.into(),
            subject: subject.into(),
            topic: topic.into(),
        }
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.tenant_id, self.student_id, self.subject, self.topic)
    }
}

/// Derived metrics for one student×subject×topic. Pure function of the event
/// history plus the previously stored mastery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicMetrics {
    pub questions_attempted: i64,
    pub questions_correct: i64,
    pub accuracy: f64,
    pub avg_time_ms: Option<f64>,
    pub time_efficiency: f64,
    pub completion_rate: f64,
    pub mastery_score: f64,
    pub confidence_calibration: Option<f64>,
    pub answer_change_rate: Option<f64>,
    pub beneficial_change_rate: Option<f64>,
    pub detrimental_change_rate: Option<f64>,
    pub revisit_ratio: Option<f64>,
    pub work_break_ratio: Option<f64>,
    pub consistency_score: f64,
    pub learning_velocity: Option<f64>,
    pub risk_level: RiskLevel,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// SM-2 scheduling state carried on a topic profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgettingCurveParams {
    pub interval_hours: f64,
    pub ease_factor: f64,
    pub repetitions: u32,
    pub next_review_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicProfile {
    pub id: String,
    #[serde(flatten)]
    pub key: TopicKey,
    #[serde(flatten)]
    pub metrics: TopicMetrics,
    pub forgetting_curve_params: Option<ForgettingCurveParams>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Archetype {
    #[serde(rename = "Methodical Planner")]
    MethodicalPlanner,
    #[serde(rename = "Deep Diver")]
    DeepDiver,
    #[serde(rename = "Broad Explorer")]
    BroadExplorer,
    #[serde(rename = "Social Collaborator")]
    SocialCollaborator,
    #[serde(rename = "Anxious Achiever")]
    AnxiousAchiever,
}

impl Archetype {
    pub const ALL: [Archetype; 5] = [
        Archetype::MethodicalPlanner,
        Archetype::DeepDiver,
        Archetype::BroadExplorer,
        Archetype::SocialCollaborator,
        Archetype::AnxiousAchiever,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Archetype::MethodicalPlanner => "Methodical Planner",
            Archetype::DeepDiver => "Deep Diver",
            Archetype::BroadExplorer => "Broad Explorer",
            Archetype::SocialCollaborator => "Social Collaborator",
            Archetype::AnxiousAchiever => "Anxious Achiever",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Archetype::ALL.into_iter().find(|a| a.name() == name)
    }
}

impl fmt::Display for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OceanScores {
    pub openness: f64,
    pub conscientiousness: f64,
    pub extraversion: f64,
    pub agreeableness: f64,
    pub neuroticism: f64,
}

/// Aggregate behavior signals feeding the Layer 2 classifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehavioralSignals {
    pub consistency: f64,
    pub work_break_ratio: Option<f64>,
    pub calibration: Option<f64>,
    pub detrimental_change_rate: Option<f64>,
    pub revisit_ratio: Option<f64>,
    pub avg_session_minutes: Option<f64>,
    pub mastery_variance: f64,
    pub ai_interaction_count: i64,
    pub topic_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchetypeProfile {
    pub id: String,
    pub tenant_id: String,
    pub student_id: String,
    pub ocean_scores: Option<OceanScores>,
    pub questionnaire_responses: Option<Vec<u8>>,
    pub self_reported_archetype: Option<Archetype>,
    pub self_reported_secondary: Option<Archetype>,
    pub self_reported_confidence: Option<f64>,
    pub self_reported_at: Option<DateTime<Utc>>,
    pub behavioral_archetype: Option<Archetype>,
    pub behavioral_confidence: Option<f64>,
    pub behavioral_signals: Option<BehavioralSignals>,
    pub behavioral_computed_at: Option<DateTime<Utc>>,
    pub discrepancy: bool,
    pub blind_spots: Vec<String>,
    pub reveal_narrative: Option<String>,
    pub reveal_source: Option<String>,
    pub reveal_generated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_str() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
        assert!("quiz_taken".parse::<EventType>().is_err());
    }

    #[test]
    fn risk_levels_are_ordered() {
        assert!(RiskLevel::High > RiskLevel::Medium);
        assert!(RiskLevel::Medium > RiskLevel::Low);
        assert_eq!(RiskLevel::parse("HIGH"), Some(RiskLevel::High));
        assert_eq!(RiskLevel::parse("severe"), None);
    }

    #[test]
    fn archetype_serializes_with_display_name() {
        let json = serde_json::to_string(&Archetype::MethodicalPlanner).unwrap();
        assert_eq!(json, "\"Methodical Planner\"");
        assert_eq!(Archetype::from_name("Deep Diver"), Some(Archetype::DeepDiver));
    }
}
