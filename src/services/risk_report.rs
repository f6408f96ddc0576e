use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::db::operations::events::{self, day_index};
use crate::db::operations::topic_profiles::{self, ProfileFilter};
use crate::db::Database;
use crate::error::EngineError;
use crate::models::{RiskLevel, TopicProfile};
use crate::services::profile_aggregator::{mean, round4};

pub const STREAK_WINDOW_DAYS: i64 = 90;
pub const LOW_MASTERY_THRESHOLD: f64 = 0.30;
pub const DECLINE_THRESHOLD: f64 = -0.10;
pub const INACTIVITY_DAYS: i64 = 14;
pub const ACTIVITY_WEEKS: i64 = 8;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSummary {
    pub subject: String,
    pub topic: String,
    pub mastery_score: f64,
    pub risk_level: RiskLevel,
    pub learning_velocity: Option<f64>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl From<&TopicProfile> for TopicSummary {
    fn from(p: &TopicProfile) -> Self {
        Self {
            subject: p.key.subject.clone(),
            topic: p.key.topic.clone(),
            mastery_score: p.metrics.mastery_score,
            risk_level: p.metrics.risk_level,
            learning_velocity: p.metrics.learning_velocity,
            last_event_at: p.metrics.last_event_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub student_id: String,
    pub average_mastery: f64,
    pub overall_risk: RiskLevel,
    pub topics: Vec<TopicSummary>,
    pub total_events: i64,
    pub last_active_at: Option<DateTime<Utc>>,
    pub study_streak_days: i64,
}

pub async fn get_student_summary(
    db: &Database,
    tenant_id: &str,
    student_id: &str,
) -> Result<StudentSummary, EngineError> {
    get_student_summary_at(db, tenant_id, student_id, Utc::now()).await
}

pub async fn get_student_summary_at(
    db: &Database,
    tenant_id: &str,
    student_id: &str,
    now: DateTime<Utc>,
) -> Result<StudentSummary, EngineError> {
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
    let activity = events::student_activity(pool, tenant_id, student_id).await?;
    let active_days =
        events::active_day_indices(pool, tenant_id, student_id, now - Duration::days(STREAK_WINDOW_DAYS)).await?;

    let masteries: Vec<f64> = profiles.iter().map(|p| p.metrics.mastery_score).collect();

    Ok(StudentSummary {
        student_id: student_id.to_string(),
        average_mastery: mean(&masteries).map(round4).unwrap_or(0.0),
        overall_risk: profiles
            .iter()
            .map(|p| p.metrics.risk_level)
            .max()
            .unwrap_or_default(),
        topics: profiles.iter().map(TopicSummary::from).collect(),
        total_events: activity.total_events,
        last_active_at: activity.last_event_at,
        study_streak_days: study_streak(&active_days, day_index(now)),
    })
}

/// Consecutive active days ending today, or ending yesterday when today has no
/// activity yet. `active_days` must be sorted newest first.
pub fn study_streak(active_days: &[i64], today: i64) -> i64 {
    let days: HashSet<i64> = active_days.iter().copied().collect();
    let mut cursor = if days.contains(&today) { today } else { today - 1 };
    let mut streak = 0;
    while days.contains(&cursor) && streak < STREAK_WINDOW_DAYS {
        streak += 1;
        cursor -= 1;
    }
    streak
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intervention {
    ReEngagementOutreach,
    ReviewDecline,
    TargetedRemediation,
    Monitor,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AtRiskStudent {
    pub student_id: String,
    pub risk_level: RiskLevel,
    pub average_mastery: f64,
    pub worst_velocity: Option<f64>,
    pub days_inactive: Option<i64>,
    pub flagged_topics: Vec<TopicSummary>,
    pub reasons: Vec<String>,
    pub recommended_intervention: Intervention,
}

pub async fn get_at_risk_students(
    db: &Database,
    tenant_id: &str,
    department: Option<&str>,
    threshold: RiskLevel,
) -> Result<Vec<AtRiskStudent>, EngineError> {
    get_at_risk_students_at(db, tenant_id, department, threshold, Utc::now()).await
}

pub async fn get_at_risk_students_at(
    db: &Database,
    tenant_id: &str,
    department: Option<&str>,
    threshold: RiskLevel,
    now: DateTime<Utc>,
) -> Result<Vec<AtRiskStudent>, EngineError> {
    let pool = db.pool();
    let flagged = topic_profiles::list_profiles(
        pool,
        tenant_id,
        &ProfileFilter {
            subject: department,
            min_risk: Some(threshold),
            ..Default::default()
        },
    )
    .await?;
    if flagged.is_empty() {
        return Ok(Vec::new());
    }

    let last_events = events::last_event_times(pool, tenant_id).await?;
    Ok(build_at_risk_report(&flagged, &last_events, now))
}

/// Groups flagged rows by student and derives reasons and an intervention.
pub fn build_at_risk_report(
    flagged: &[TopicProfile],
    last_events: &HashMap<String, DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Vec<AtRiskStudent> {
    let mut by_student: BTreeMap<&str, Vec<&TopicProfile>> = BTreeMap::new();
    for profile in flagged {
        by_student.entry(profile.key.student_id.as_str()).or_default().push(profile);
    }

    let mut report: Vec<AtRiskStudent> = by_student
        .into_iter()
        .map(|(student_id, rows)| {
            let masteries: Vec<f64> = rows.iter().map(|p| p.metrics.mastery_score).collect();
            let average_mastery = mean(&masteries).map(round4).unwrap_or(0.0);
            let worst_velocity = rows
                .iter()
                .filter_map(|p| p.metrics.learning_velocity)
                .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))));
            let days_inactive = last_events
                .get(student_id)
                .map(|last| (now - *last).num_days().max(0));

            let low_average = average_mastery < LOW_MASTERY_THRESHOLD;
            let declining = worst_velocity.is_some_and(|v| v < DECLINE_THRESHOLD);
            let inactive = days_inactive.is_some_and(|d| d >= INACTIVITY_DAYS);

            let mut reasons = Vec::new();
            if low_average {
                reasons.push(format!("low mastery (average {average_mastery:.2})"));
            }
            if declining {
                reasons.push("rapidly declining".to_string());
            }
            if let Some(days) = days_inactive.filter(|_| inactive) {
                reasons.push(format!("no activity for {days} days"));
            }
            let mut low_topics = false;
            for p in rows.iter().filter(|p| p.metrics.mastery_score < LOW_MASTERY_THRESHOLD) {
                low_topics = true;
                reasons.push(format!("low mastery in {}/{}", p.key.subject, p.key.topic));
            }

            let recommended_intervention = if inactive {
                Intervention::ReEngagementOutreach
            } else if declining {
                Intervention::ReviewDecline
            } else if low_average || low_topics {
                Intervention::TargetedRemediation
            } else {
                Intervention::Monitor
            };

            AtRiskStudent {
                student_id: student_id.to_string(),
                risk_level: rows.iter().map(|p| p.metrics.risk_level).max().unwrap_or_default(),
                average_mastery,
                worst_velocity,
                days_inactive,
                flagged_topics: rows.iter().copied().map(TopicSummary::from).collect(),
                reasons,
                recommended_intervention,
            }
        })
        .collect();

    report.sort_by(|a, b| {
        a.average_mastery
            .total_cmp(&b.average_mastery)
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    report
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicAnalytics {
    pub subject: String,
    pub topic: String,
    pub average_mastery: f64,
    pub student_count: i64,
    pub at_risk_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RiskDistribution {
    pub low: i64,
    pub medium: i64,
    pub high: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyActivity {
    pub week_start: DateTime<Utc>,
    pub active_students: i64,
    pub total_events: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentAnalytics {
    pub department: Option<String>,
    pub total_students: i64,
    pub topics: Vec<TopicAnalytics>,
    pub risk_distribution: RiskDistribution,
    pub weekly_activity: Vec<WeeklyActivity>,
}

pub async fn get_department_analytics(
    db: &Database,
    tenant_id: &str,
    department: Option<&str>,
) -> Result<DepartmentAnalytics, EngineError> {
    get_department_analytics_at(db, tenant_id, department, Utc::now()).await
}

pub async fn get_department_analytics_at(
    db: &Database,
    tenant_id: &str,
    department: Option<&str>,
    now: DateTime<Utc>,
) -> Result<DepartmentAnalytics, EngineError> {
    let pool = db.pool();
    let profiles = topic_profiles::list_profiles(
        pool,
        tenant_id,
        &ProfileFilter {
            subject: department,
            ..Default::default()
        },
    )
    .await?;

    let mut weekly_activity = Vec::with_capacity(ACTIVITY_WEEKS as usize);
    for (start, end) in week_windows(now) {
        let (active_students, total_events) =
            events::window_activity(pool, tenant_id, department, start, end).await?;
        weekly_activity.push(WeeklyActivity {
            week_start: start,
            active_students,
            total_events,
        });
    }

    let students: HashSet<&str> = profiles.iter().map(|p| p.key.student_id.as_str()).collect();

    Ok(DepartmentAnalytics {
        department: department.map(str::to_string),
        total_students: students.len() as i64,
        topics: summarize_topics(&profiles),
        risk_distribution: risk_distribution(&profiles),
        weekly_activity,
    })
}

/// Non-overlapping 7-day windows `(start, end]` ending at `now`, oldest first.
pub fn week_windows(now: DateTime<Utc>) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    (0..ACTIVITY_WEEKS)
        .rev()
        .map(|weeks_back| {
            let end = now - Duration::weeks(weeks_back);
            (end - Duration::weeks(1), end)
        })
        .collect()
}

pub fn summarize_topics(profiles: &[TopicProfile]) -> Vec<TopicAnalytics> {
    let mut groups: BTreeMap<(&str, &str), Vec<&TopicProfile>> = BTreeMap::new();
    for p in profiles {
        groups
            .entry((p.key.subject.as_str(), p.key.topic.as_str()))
            .or_default()
            .push(p);
    }

    groups
        .into_iter()
        .map(|((subject, topic), rows)| {
            let masteries: Vec<f64> = rows.iter().map(|p| p.metrics.mastery_score).collect();
            let students: HashSet<&str> = rows.iter().map(|p| p.key.student_id.as_str()).collect();
            TopicAnalytics {
                subject: subject.to_string(),
                topic: topic.to_string(),
                average_mastery: mean(&masteries).map(round4).unwrap_or(0.0),
                student_count: students.len() as i64,
                at_risk_count: rows
                    .iter()
                    .filter(|p| p.metrics.risk_level == RiskLevel::High)
                    .count() as i64,
            }
        })
        .collect()
}

pub fn risk_distribution(profiles: &[TopicProfile]) -> RiskDistribution {
    profiles.iter().fold(RiskDistribution::default(), |mut acc, p| {
        match p.metrics.risk_level {
            RiskLevel::Low => acc.low += 1,
            RiskLevel::Medium => acc.medium += 1,
            RiskLevel::High => acc.high += 1,
        }
        acc
    })
}
