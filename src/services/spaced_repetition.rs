use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::db::operations::topic_profiles::{self, ProfileFilter};
use crate::db::Database;
use crate::error::EngineError;
use crate::models::{ForgettingCurveParams, TopicKey};

pub const INITIAL_EASE_FACTOR: f64 = 2.5;
pub const MIN_EASE_FACTOR: f64 = 1.3;
pub const FIRST_INTERVAL_HOURS: f64 = 24.0;
pub const SECOND_INTERVAL_HOURS: f64 = 144.0;
pub const MAX_INTERVAL_HOURS: f64 = 365.0 * 24.0;
pub const PASSING_QUALITY: u8 = 3;
pub const MAX_QUALITY: u8 = 5;

impl Default for ForgettingCurveParams {
    fn default() -> Self {
        Self {
            interval_hours: 0.0,
            ease_factor: INITIAL_EASE_FACTOR,
            repetitions: 0,
            next_review_at: None,
            last_reviewed_at: None,
        }
    }
}

/// One SM-2 step. A failing grade resets the card to the learning state; a
/// passing grade grows the interval and adjusts the ease factor.
pub fn review(
    state: &ForgettingCurveParams,
    quality: u8,
    now: DateTime<Utc>,
) -> Result<ForgettingCurveParams, EngineError> {
    if quality > MAX_QUALITY {
        return Err(EngineError::validation(format!(
            "review quality must be between 0 and {MAX_QUALITY}, got {quality}"
        )));
    }

    let mut next = state.clone();

    if quality >= PASSING_QUALITY {
        next.interval_hours = match state.repetitions {
            0 => FIRST_INTERVAL_HOURS,
            1 => SECOND_INTERVAL_HOURS,
            _ => state.interval_hours * state.ease_factor,
        };
        next.repetitions = state.repetitions + 1;

        let miss = f64::from(MAX_QUALITY - quality);
        next.ease_factor = (state.ease_factor + (0.1 - miss * (0.08 + miss * 0.02))).max(MIN_EASE_FACTOR);
    } else {
        next.repetitions = 0;
        next.interval_hours = FIRST_INTERVAL_HOURS;
    }

    next.interval_hours = next.interval_hours.min(MAX_INTERVAL_HOURS);
    next.next_review_at = Some(now + interval_duration(next.interval_hours));
    next.last_reviewed_at = Some(now);

    Ok(next)
}

fn interval_duration(hours: f64) -> Duration {
    Duration::milliseconds((hours * 3_600_000.0).round() as i64)
}

/// Integer grade 0..=5 from a payload value; anything else is not a grade.
pub fn parse_quality(value: &Value) -> Option<u8> {
    if let Some(q) = value.as_u64() {
        return u8::try_from(q).ok().filter(|q| *q <= MAX_QUALITY);
    }
    let q = value.as_f64()?;
    if q.fract() == 0.0 && (0.0..=f64::from(MAX_QUALITY)).contains(&q) {
        Some(q as u8)
    } else {
        None
    }
}

pub async fn record_review(
    db: &Database,
    key: &TopicKey,
    quality: u8,
) -> Result<Option<ForgettingCurveParams>, EngineError> {
    record_review_at(db, key, quality, Utc::now()).await
}

/// Applies a graded review to the key's stored SM-2 state. Returns `None` when
/// the key has no topic profile yet.
pub async fn record_review_at(
    db: &Database,
    key: &TopicKey,
    quality: u8,
    now: DateTime<Utc>,
) -> Result<Option<ForgettingCurveParams>, EngineError> {
    let pool = db.pool();

    let Some(profile) = topic_profiles::get_topic_profile(pool, key).await? else {
        warn!(key = %key, "review recorded for a topic without a profile");
        return Ok(None);
    };

    let current = profile.forgetting_curve_params.unwrap_or_default();
    let next = review(&current, quality, now)?;

    if !topic_profiles::update_forgetting_params(pool, key, &next, now).await? {
        return Ok(None);
    }

    debug!(
        key = %key,
        quality,
        interval_hours = next.interval_hours,
        ease_factor = next.ease_factor,
        repetitions = next.repetitions,
        "review scheduled"
    );

    Ok(Some(next))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DueReview {
    pub subject: String,
    pub topic: String,
    pub next_review_at: DateTime<Utc>,
    pub interval_hours: f64,
    pub repetitions: u32,
}

pub async fn due_reviews(
    db: &Database,
    tenant_id: &str,
    student_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<DueReview>, EngineError> {
    let profiles = topic_profiles::list_profiles(
        db.pool(),
        tenant_id,
        &ProfileFilter {
            student_id: Some(student_id),
            ..Default::default()
        },
    )
    .await?;

    let mut due: Vec<DueReview> = profiles
        .into_iter()
        .filter_map(|p| {
            let params = p.forgetting_curve_params?;
            let next_review_at = params.next_review_at.filter(|at| *at <= now)?;
            Some(DueReview {
                subject: p.key.subject,
                topic: p.key.topic,
                next_review_at,
                interval_hours: params.interval_hours,
                repetitions: params.repetitions,
            })
        })
        .collect();
    due.sort_by_key(|d| d.next_review_at);

    Ok(due)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn three_perfect_reviews_grow_the_interval() {
        let fresh = ForgettingCurveParams::default();

        let first = review(&fresh, 5, now()).unwrap();
        assert_eq!(first.interval_hours, 24.0);
        assert_eq!(first.repetitions, 1);

        let second = review(&first, 5, now()).unwrap();
        assert_eq!(second.interval_hours, 144.0);
        assert_eq!(second.repetitions, 2);

        let third = review(&second, 5, now()).unwrap();
        assert!((third.interval_hours - 144.0 * second.ease_factor).abs() < 1e-9);
        assert!((second.ease_factor - 2.7).abs() < 1e-9);
        assert_eq!(third.next_review_at, Some(now() + interval_duration(third.interval_hours)));
    }

    #[test]
    fn failing_grade_resets_repetitions() {
        let state = ForgettingCurveParams {
            interval_hours: 400.0,
            ease_factor: 2.36,
            repetitions: 3,
            next_review_at: None,
            last_reviewed_at: None,
        };
        let next = review(&state, 2, now()).unwrap();
        assert_eq!(next.repetitions, 0);
        assert_eq!(next.interval_hours, 24.0);
        assert_eq!(next.ease_factor, 2.36);
        assert_eq!(next.next_review_at, Some(now() + Duration::hours(24)));
    }

    #[test]
    fn ease_factor_has_a_floor() {
        let state = ForgettingCurveParams {
            ease_factor: 1.35,
            repetitions: 4,
            interval_hours: 100.0,
            ..Default::default()
        };
        let next = review(&state, 3, now()).unwrap();
        assert_eq!(next.ease_factor, MIN_EASE_FACTOR);
    }

    #[test]
    fn interval_is_capped_at_one_year() {
        let state = ForgettingCurveParams {
            ease_factor: 2.5,
            repetitions: 9,
            interval_hours: 8000.0,
            ..Default::default()
        };
        let next = review(&state, 4, now()).unwrap();
        assert_eq!(next.interval_hours, MAX_INTERVAL_HOURS);
    }

    #[test]
    fn out_of_range_quality_is_rejected() {
        let err = review(&ForgettingCurveParams::default(), 6, now()).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn quality_parsing_accepts_integral_grades_only() {
        assert_eq!(parse_quality(&json!(4)), Some(4));
        assert_eq!(parse_quality(&json!(3.0)), Some(3));
        assert_eq!(parse_quality(&json!(3.5)), None);
        assert_eq!(parse_quality(&json!(-1)), None);
        assert_eq!(parse_quality(&json!(9)), None);
        assert_eq!(parse_quality(&json!("5")), None);
    }
}
