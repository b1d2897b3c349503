use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub joined_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepSession {
    pub date: NaiveDate,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub recorded_date: NaiveDate,
    pub step_count: f64,
    pub active_energy_burned: f64,
    pub sleep_sessions: Vec<SleepSession>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CohortKind {
    LowSleep,
    HighSteps,
    StepDrop,
    Absence,
}

impl CohortKind {
    pub const ALL: [CohortKind; 4] = [
        CohortKind::LowSleep,
        CohortKind::HighSteps,
        CohortKind::StepDrop,
        CohortKind::Absence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CohortKind::LowSleep => "low_sleep",
            CohortKind::HighSteps => "high_steps",
            CohortKind::StepDrop => "step_drop",
            CohortKind::Absence => "absence",
        }
    }

    /// Label handed to the notification composer.
    pub fn topic(&self) -> &'static str {
        match self {
            CohortKind::LowSleep => "insufficient sleep over the past week",
            CohortKind::HighSteps => "reaching 10,000 steps today",
            CohortKind::StepDrop => "a drop in weekly step count",
            CohortKind::Absence => "time away from tracking",
        }
    }
}

impl std::fmt::Display for CohortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortResult {
    pub user_id: Uuid,
    pub kind: CohortKind,
    pub metric_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbsenceSummary {
    pub user_id: Uuid,
    pub days_absent: i64,
    pub total_steps: f64,
    pub total_calories: f64,
    pub perfect_sleep_nights: usize,
}
