use uuid::Uuid;

use crate::models::{AbsenceSummary, HealthRecord};
use crate::store::RecordStore;

pub const PERFECT_SLEEP_SECONDS: f64 = 8.0 * 3600.0;

/// Decides whether a record counts as a perfect night of sleep.
pub type PerfectNightPolicy = fn(&HealthRecord) -> bool;

/// Only the first sleep session of the record is inspected.
pub fn first_session_is_perfect(record: &HealthRecord) -> bool {
    record
        .sleep_sessions
        .first()
        .is_some_and(|session| session.duration_seconds >= PERFECT_SLEEP_SECONDS)
}

pub fn any_session_is_perfect(record: &HealthRecord) -> bool {
    record
        .sleep_sessions
        .iter()
        .any(|session| session.duration_seconds >= PERFECT_SLEEP_SECONDS)
}

/// Lifetime totals over the user's entire history. Empty history yields zeros.
pub fn summarize_absence(
    store: &dyn RecordStore,
    user_id: Uuid,
    days_absent: i64,
    perfect_night: PerfectNightPolicy,
) -> AbsenceSummary {
    let records = store.records_for_user(user_id);

    AbsenceSummary {
        user_id,
        days_absent,
        total_steps: records.iter().map(|record| record.step_count).sum(),
        total_calories: records.iter().map(|record| record.active_energy_burned).sum(),
        perfect_sleep_nights: records.iter().filter(|record| perfect_night(record)).count(),
    }
}
