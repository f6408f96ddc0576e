use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::db::operations::events::{self, day_index, EventQuery};
use crate::db::operations::topic_profiles;
use crate::db::Database;
use crate::error::EngineError;
use crate::models::{EventType, LearningEvent, Payload, RiskLevel, TopicKey, TopicMetrics, TopicProfile};

pub const QUESTION_HISTORY_LIMIT: i64 = 500;
pub const SESSION_HISTORY_LIMIT: i64 = 50;
pub const TARGET_QUESTIONS_PER_TOPIC: f64 = 20.0;
pub const EXPECTED_TIME_MS: f64 = 60_000.0;
pub const NEUTRAL_TIME_EFFICIENCY: f64 = 0.5;
pub const MIN_CALIBRATION_PAIRS: usize = 5;
pub const VELOCITY_WINDOW_DAYS: f64 = 30.0;

const ZERO_VARIANCE: f64 = 1e-12;

/// Everything a recompute reads, already loaded from the store.
#[derive(Debug, Clone, Default)]
pub struct TopicHistory {
    /// `question_answered` payloads for the key, newest first.
    pub questions: Vec<Payload>,
    /// `navigation_event` payloads for the key.
    pub navigation: Vec<Payload>,
    /// Student-wide `study_session_ended` payloads.
    pub sessions: Vec<Payload>,
    pub active_days: i64,
    pub span_days: i64,
    pub last_event_at: Option<DateTime<Utc>>,
}

pub async fn recompute_topic_profile(db: &Database, key: &TopicKey) -> Result<TopicProfile, EngineError> {
    recompute_topic_profile_at(db, key, Utc::now()).await
}

/// Full recompute of one key: read history, compute in memory, single upsert.
/// Any failure before the upsert leaves the stored row untouched.
pub async fn recompute_topic_profile_at(
    db: &Database,
    key: &TopicKey,
    now: DateTime<Utc>,
) -> Result<TopicProfile, EngineError> {
    let pool = db.pool();

    let history = load_topic_history(db, key, now).await?;
    if history.last_event_at.is_none() {
        return Err(EngineError::validation(format!("no events recorded for {key}")));
    }

    let previous = topic_profiles::get_topic_profile(pool, key).await?;
    let previous_mastery = previous.as_ref().map(|p| p.metrics.mastery_score);
    let metrics = compute_topic_metrics(&history, previous_mastery);

    topic_profiles::upsert_topic_metrics(pool, key, &metrics, now).await?;

    debug!(
        tenant_id = %key.tenant_id,
        student_id = %key.student_id,
        subject = %key.subject,
        topic = %key.topic,
        mastery = metrics.mastery_score,
        risk = metrics.risk_level.as_str(),
        "topic profile recomputed"
    );

    topic_profiles::get_topic_profile(pool, key)
        .await?
        .ok_or(EngineError::Database(sqlx::Error::RowNotFound))
}

pub async fn load_topic_history(
    db: &Database,
    key: &TopicKey,
    now: DateTime<Utc>,
) -> Result<TopicHistory, EngineError> {
    let pool = db.pool();

    let questions = events::query_events(
        pool,
        &EventQuery {
            limit: QUESTION_HISTORY_LIMIT,
            ..EventQuery::for_topic(key, EventType::QuestionAnswered)
        },
    )
    .await?;

    let navigation = events::query_events(
        pool,
        &EventQuery {
            limit: QUESTION_HISTORY_LIMIT,
            ..EventQuery::for_topic(key, EventType::NavigationEvent)
        },
    )
    .await?;

    let sessions = events::query_events(
        pool,
        &EventQuery {
            event_type: Some(EventType::StudySessionEnded),
            limit: SESSION_HISTORY_LIMIT,
            ..EventQuery::new(&key.tenant_id, &key.student_id)
        },
    )
    .await?;

    let latest = events::query_events(
        pool,
        &EventQuery {
            subject: Some(key.subject.as_str()),
            topic: Some(key.topic.as_str()),
            limit: 1,
            ..EventQuery::new(&key.tenant_id, &key.student_id)
        },
    )
    .await?;

    let activity = events::student_activity(pool, &key.tenant_id, &key.student_id).await?;
    let span_days = activity
        .first_event_at
        .map(|first| (day_index(now) - day_index(first) + 1).max(1))
        .unwrap_or(0);

    Ok(TopicHistory {
        questions: into_payloads(questions),
        navigation: into_payloads(navigation),
        sessions: into_payloads(sessions),
        active_days: activity.active_days,
        span_days,
        last_event_at: latest.first().map(|e| e.occurred_at),
    })
}

fn into_payloads(events: Vec<LearningEvent>) -> Vec<Payload> {
    events.into_iter().map(|e| e.payload).collect()
}

pub fn compute_topic_metrics(history: &TopicHistory, previous_mastery: Option<f64>) -> TopicMetrics {
    let attempted = history.questions.len() as i64;
    let correct = history.questions.iter().filter(|p| is_correct(p)).count() as i64;
    let accuracy = if attempted > 0 {
        correct as f64 / attempted as f64
    } else {
        0.0
    };

    let times: Vec<f64> = history
        .questions
        .iter()
        .filter_map(|p| number(p, "timeTakenMs"))
        .filter(|t| *t >= 0.0)
        .collect();
    let avg_time_ms = mean(&times);
    let time_efficiency = match avg_time_ms {
        Some(avg) if avg > 0.0 => (EXPECTED_TIME_MS / avg).min(1.0),
        _ => NEUTRAL_TIME_EFFICIENCY,
    };

    let completion_rate = (attempted as f64 / TARGET_QUESTIONS_PER_TOPIC).min(1.0);
    let mastery_score = mastery(accuracy, completion_rate, time_efficiency);

    let pairs: Vec<(f64, f64)> = history
        .questions
        .iter()
        .filter_map(|p| {
            let confidence = number(p, "confidenceRating")?;
            Some((confidence, if is_correct(p) { 1.0 } else { 0.0 }))
        })
        .collect();
    let confidence_calibration = pearson_correlation(&pairs);

    let changes = answer_changes(&history.questions);
    let answer_change_rate = (attempted > 0).then(|| changes.total as f64 / attempted as f64);
    let (beneficial_change_rate, detrimental_change_rate) = if changes.total > 0 {
        (
            Some(changes.beneficial as f64 / changes.total as f64),
            Some(changes.detrimental as f64 / changes.total as f64),
        )
    } else {
        (None, None)
    };

    let revisits = history
        .navigation
        .iter()
        .filter(|p| p.get("action").and_then(Value::as_str) == Some("revisit"))
        .count();
    let revisit_ratio = (attempted > 0).then(|| revisits as f64 / attempted as f64);

    let work_break_ratio = work_break_ratio(&history.sessions);
    let consistency_score = consistency(history.active_days, history.span_days);

    let learning_velocity = previous_mastery.map(|prev| (mastery_score - prev) / VELOCITY_WINDOW_DAYS);
    let risk_level = classify_risk(mastery_score, learning_velocity);

    TopicMetrics {
        questions_attempted: attempted,
        questions_correct: correct,
        accuracy,
        avg_time_ms,
        time_efficiency,
        completion_rate,
        mastery_score,
        confidence_calibration,
        answer_change_rate,
        beneficial_change_rate,
        detrimental_change_rate,
        revisit_ratio,
        work_break_ratio,
        consistency_score,
        learning_velocity,
        risk_level,
        last_event_at: history.last_event_at,
    }
}

/// `0.4·accuracy + 0.3·completion + 0.3·timeEfficiency`, rounded to 4 places.
pub fn mastery(accuracy: f64, completion_rate: f64, time_efficiency: f64) -> f64 {
    round4(0.4 * accuracy + 0.3 * completion_rate + 0.3 * time_efficiency)
}

pub fn classify_risk(mastery: f64, velocity: Option<f64>) -> RiskLevel {
    let velocity = velocity.unwrap_or(0.0);
    if mastery < 0.30 || velocity < -0.10 {
        RiskLevel::High
    } else if mastery < 0.50 || velocity < 0.0 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Product-moment correlation with population variances. `None` with fewer
/// than five pairs or when either side has no variance.
pub fn pearson_correlation(pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.len() < MIN_CALIBRATION_PAIRS {
        return None;
    }

    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;

    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    cov /= n;
    var_x /= n;
    var_y /= n;

    if var_x < ZERO_VARIANCE || var_y < ZERO_VARIANCE {
        return None;
    }

    Some((cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnswerChanges {
    pub total: usize,
    pub beneficial: usize,
    pub detrimental: usize,
}

pub fn answer_changes(questions: &[Payload]) -> AnswerChanges {
    let mut changes = AnswerChanges::default();

    for payload in questions {
        if payload.get("answerChanged").and_then(Value::as_bool) != Some(true) {
            continue;
        }
        changes.total += 1;

        let Some(correct) = present(payload, "correctAnswer") else {
            continue;
        };
        let initial_right = present(payload, "initialAnswer").map(|v| v == correct);
        let final_right = present(payload, "finalAnswer").map(|v| v == correct);

        match (initial_right, final_right) {
            (Some(false), Some(true)) => changes.beneficial += 1,
            (Some(true), Some(false)) => changes.detrimental += 1,
            _ => {}
        }
    }

    changes
}

/// Σ session minutes ÷ Σ break minutes; `None` when no break time recorded.
pub fn work_break_ratio(sessions: &[Payload]) -> Option<f64> {
    let work: f64 = sessions
        .iter()
        .filter_map(|p| number(p, "durationMinutes"))
        .filter(|m| *m >= 0.0)
        .sum();
    let breaks: f64 = sessions
        .iter()
        .filter_map(|p| number(p, "breakTimeMinutes"))
        .filter(|m| *m >= 0.0)
        .sum();

    (breaks > 0.0).then(|| work / breaks)
}

pub fn consistency(active_days: i64, span_days: i64) -> f64 {
    if span_days <= 0 {
        return 0.0;
    }
    (active_days as f64 / span_days as f64).min(1.0)
}

pub fn is_correct(payload: &Payload) -> bool {
    match (present(payload, "selected"), present(payload, "correctAnswer")) {
        (Some(selected), Some(correct)) => selected == correct,
        _ => false,
    }
}

pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub(crate) fn number(payload: &Payload, key: &str) -> Option<f64> {
    payload.get(key).and_then(Value::as_f64).filter(|v| v.is_finite())
}

fn present<'a>(payload: &'a Payload, key: &str) -> Option<&'a Value> {
    payload.get(key).filter(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    fn answer(correct: bool, time_ms: f64) -> Payload {
        payload(json!({
            "selected": if correct { "a" } else { "b" },
            "correctAnswer": "a",
            "timeTakenMs": time_ms,
        }))
    }

    #[test]
    fn fifteen_of_twenty_at_fifty_seconds_is_point_nine() {
        let mut questions: Vec<Payload> = (0..15).map(|_| answer(true, 50_000.0)).collect();
        questions.extend((0..5).map(|_| answer(false, 50_000.0)));
        let history = TopicHistory {
            questions,
            active_days: 1,
            span_days: 1,
            ..Default::default()
        };

        let metrics = compute_topic_metrics(&history, None);
        assert_eq!(metrics.questions_attempted, 20);
        assert_eq!(metrics.questions_correct, 15);
        assert!((metrics.accuracy - 0.75).abs() < 1e-12);
        assert_eq!(metrics.completion_rate, 1.0);
        assert_eq!(metrics.time_efficiency, 1.0);
        assert_eq!(metrics.mastery_score, 0.9);
        assert_eq!(metrics.risk_level, RiskLevel::Low);
        assert_eq!(metrics.learning_velocity, None);
    }

    #[test]
    fn no_answers_uses_neutral_time_efficiency() {
        let metrics = compute_topic_metrics(&TopicHistory::default(), None);
        assert_eq!(metrics.accuracy, 0.0);
        assert_eq!(metrics.time_efficiency, NEUTRAL_TIME_EFFICIENCY);
        assert_eq!(metrics.mastery_score, 0.15);
        assert_eq!(metrics.revisit_ratio, None);
        assert_eq!(metrics.answer_change_rate, None);
    }

    #[test]
    fn slow_answers_reduce_time_efficiency() {
        let history = TopicHistory {
            questions: vec![answer(true, 120_000.0)],
            ..Default::default()
        };
        let metrics = compute_topic_metrics(&history, None);
        assert_eq!(metrics.time_efficiency, 0.5);
        assert_eq!(metrics.completion_rate, 0.05);
    }

    #[test]
    fn calibration_needs_five_pairs() {
        let pairs = [(1.0, 0.0), (2.0, 0.0), (4.0, 1.0), (5.0, 1.0)];
        assert_eq!(pearson_correlation(&pairs), None);
    }

    #[test]
    fn calibration_is_null_without_variance() {
        let pairs = [(3.0, 0.0), (3.0, 1.0), (3.0, 1.0), (3.0, 0.0), (3.0, 1.0)];
        assert_eq!(pearson_correlation(&pairs), None);
    }

    #[test]
    fn calibration_of_perfectly_correlated_pairs_is_one() {
        let pairs = [(1.0, 0.0), (1.0, 0.0), (5.0, 1.0), (5.0, 1.0), (5.0, 1.0)];
        let r = pearson_correlation(&pairs).unwrap();
        assert!((r - 1.0).abs() < 1e-6);
    }

    #[test]
    fn calibration_reads_confidence_from_payload() {
        let questions: Vec<Payload> = [(1, false), (2, false), (4, true), (5, true), (5, true)]
            .into_iter()
            .map(|(confidence, correct)| {
                let mut p = answer(correct, 30_000.0);
                p.insert("confidenceRating".into(), json!(confidence));
                p
            })
            .collect();
        let history = TopicHistory { questions, ..Default::default() };
        let calibration = compute_topic_metrics(&history, None).confidence_calibration.unwrap();
        assert!(calibration > 0.9);
    }

    #[test]
    fn answer_changes_are_classified_by_direction() {
        let questions = vec![
            payload(json!({"answerChanged": true, "initialAnswer": "b", "finalAnswer": "a", "correctAnswer": "a", "selected": "a"})),
            payload(json!({"answerChanged": true, "initialAnswer": "a", "finalAnswer": "c", "correctAnswer": "a", "selected": "c"})),
            payload(json!({"answerChanged": true, "initialAnswer": "b", "finalAnswer": "c", "correctAnswer": "a", "selected": "c"})),
            payload(json!({"answerChanged": true, "initialAnswer": "b", "finalAnswer": "a", "correctAnswer": "a", "selected": "a"})),
            payload(json!({"answerChanged": false, "selected": "a", "correctAnswer": "a"})),
        ];
        let history = TopicHistory { questions, ..Default::default() };
        let metrics = compute_topic_metrics(&history, None);
        assert_eq!(metrics.answer_change_rate, Some(0.8));
        assert_eq!(metrics.beneficial_change_rate, Some(0.5));
        assert_eq!(metrics.detrimental_change_rate, Some(0.25));
    }

    #[test]
    fn revisit_ratio_counts_only_revisits() {
        let history = TopicHistory {
            questions: vec![answer(true, 1000.0), answer(true, 1000.0), answer(true, 1000.0), answer(true, 1000.0)],
            navigation: vec![
                payload(json!({"action": "revisit"})),
                payload(json!({"action": "next"})),
                payload(json!({"action": "revisit"})),
            ],
            ..Default::default()
        };
        assert_eq!(compute_topic_metrics(&history, None).revisit_ratio, Some(0.5));
    }

    #[test]
    fn work_break_ratio_skips_malformed_sessions() {
        let sessions = vec![
            payload(json!({"durationMinutes": 50, "breakTimeMinutes": 10})),
            payload(json!({"durationMinutes": "forty", "breakTimeMinutes": 10})),
            payload(json!({"durationMinutes": 30})),
        ];
        assert_eq!(work_break_ratio(&sessions), Some(4.0));
        assert_eq!(work_break_ratio(&[payload(json!({"durationMinutes": 30}))]), None);
    }

    #[test]
    fn consistency_caps_at_one() {
        assert_eq!(consistency(5, 10), 0.5);
        assert_eq!(consistency(3, 2), 1.0);
        assert_eq!(consistency(0, 0), 0.0);
    }

    #[test]
    fn velocity_uses_previous_mastery() {
        let history = TopicHistory {
            questions: vec![answer(false, 60_000.0)],
            ..Default::default()
        };
        let metrics = compute_topic_metrics(&history, Some(0.9));
        let expected = (metrics.mastery_score - 0.9) / 30.0;
        assert!((metrics.learning_velocity.unwrap() - expected).abs() < 1e-12);
        assert_eq!(metrics.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn risk_thresholds() {
        assert_eq!(classify_risk(0.29, Some(0.0)), RiskLevel::High);
        assert_eq!(classify_risk(0.45, Some(0.01)), RiskLevel::Medium);
        assert_eq!(classify_risk(0.9, Some(0.05)), RiskLevel::Low);
        assert_eq!(classify_risk(0.9, Some(-0.11)), RiskLevel::High);
        assert_eq!(classify_risk(0.9, Some(-0.01)), RiskLevel::Medium);
        assert_eq!(classify_risk(0.6, None), RiskLevel::Low);
    }

    #[test]
    fn missing_selection_is_not_correct() {
        assert!(!is_correct(&payload(json!({"correctAnswer": "a"}))));
        assert!(!is_correct(&payload(json!({"selected": null, "correctAnswer": null}))));
        assert!(is_correct(&payload(json!({"selected": 2, "correctAnswer": 2}))));
    }
}
