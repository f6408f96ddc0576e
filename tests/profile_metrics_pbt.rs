//! Property tests for topic metric bounds.

use proptest::prelude::*;
use serde_json::{json, Value};

use learning_analytics::models::{Payload, RiskLevel};
use learning_analytics::services::profile_aggregator::{
    classify_risk, compute_topic_metrics, mastery, pearson_correlation, TopicHistory,
};

fn arb_unit() -> impl Strategy<Value = f64> {
    (0u32..=10_000u32).prop_map(|v| f64::from(v) / 10_000.0)
}

fn arb_answer() -> impl Strategy<Value = Payload> {
    (any::<bool>(), 0u64..=600_000u64, proptest::option::of(1u8..=5u8)).prop_map(|(correct, time, confidence)| {
        let mut value = json!({
            "selected": if correct { "A" } else { "C" },
            "correctAnswer": "A",
            "timeTakenMs": time,
        });
        if let Some(c) = confidence {
            value["confidenceRating"] = json!(c);
        }
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    })
}

proptest! {
    #[test]
    fn mastery_stays_in_unit_interval(accuracy in arb_unit(), completion in arb_unit(), efficiency in arb_unit()) {
        let m = mastery(accuracy, completion, efficiency);
        prop_assert!((0.0..=1.0).contains(&m));
    }

    #[test]
    fn computed_metrics_are_bounded(
        questions in proptest::collection::vec(arb_answer(), 0..60),
        previous in proptest::option::of(arb_unit()),
        active_days in 0i64..30,
        extra_span in 0i64..30,
    ) {
        let history = TopicHistory {
            questions,
            active_days,
            span_days: active_days + extra_span,
            ..TopicHistory::default()
        };
        let metrics = compute_topic_metrics(&history, previous);

        prop_assert!((0.0..=1.0).contains(&metrics.mastery_score));
        prop_assert!((0.0..=1.0).contains(&metrics.accuracy));
        prop_assert!((0.0..=1.0).contains(&metrics.completion_rate));
        prop_assert!((0.0..=1.0).contains(&metrics.time_efficiency));
        prop_assert!((0.0..=1.0).contains(&metrics.consistency_score));
        prop_assert!(metrics.questions_correct <= metrics.questions_attempted);
        if let Some(c) = metrics.confidence_calibration {
            prop_assert!((-1.0..=1.0).contains(&c));
        }
        prop_assert_eq!(metrics.learning_velocity.is_some(), previous.is_some());
    }

    #[test]
    fn correlation_is_bounded(pairs in proptest::collection::vec((1u8..=5u8, any::<bool>()), 0..40)) {
        let pairs: Vec<(f64, f64)> = pairs
            .into_iter()
            .map(|(c, ok)| (f64::from(c), if ok { 1.0 } else { 0.0 }))
            .collect();
        if let Some(r) = pearson_correlation(&pairs) {
            prop_assert!((-1.0..=1.0).contains(&r));
        }
    }

    #[test]
    fn low_mastery_is_always_high_risk(m in 0u32..3000u32, velocity in proptest::option::of(-1.0f64..1.0)) {
        prop_assert_eq!(classify_risk(f64::from(m) / 10_000.0, velocity), RiskLevel::High);
    }
}
