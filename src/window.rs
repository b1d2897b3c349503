use chrono::{DateTime, Duration, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::HealthRecord;
use crate::store::RecordStore;

/// Half-open range of calendar days, `[start, end_exclusive)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub start: NaiveDate,
    pub end_exclusive: NaiveDate,
}

impl DayWindow {
    pub fn between(start: NaiveDate, end_exclusive: NaiveDate) -> Self {
        Self {
            start,
            end_exclusive,
        }
    }

    /// The `days` calendar days ending with (and including) `today`.
    pub fn trailing(today: NaiveDate, days: i64) -> Self {
        let end_exclusive = today + Duration::days(1);
        Self::between(end_exclusive - Duration::days(days.max(0)), end_exclusive)
    }

    /// The `days` calendar days ending just before `end_exclusive`.
    pub fn ending_before(end_exclusive: NaiveDate, days: i64) -> Self {
        Self::between(end_exclusive - Duration::days(days.max(0)), end_exclusive)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end_exclusive
    }

    pub fn len_days(&self) -> i64 {
        (self.end_exclusive - self.start).num_days().max(0)
    }
}

/// Calendar day of the injected clock.
pub fn today(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

pub fn records_in<'a>(
    store: &'a dyn RecordStore,
    user_id: Uuid,
    window: DayWindow,
) -> impl Iterator<Item = &'a HealthRecord> + 'a {
    store
        .records_for_user(user_id)
        .iter()
        .filter(move |record| window.contains(record.recorded_date))
}

pub fn sum_steps(store: &dyn RecordStore, user_id: Uuid, window: DayWindow) -> f64 {
    records_in(store, user_id, window)
        .map(|record| record.step_count)
        .sum()
}

pub fn total_sleep_seconds(store: &dyn RecordStore, user_id: Uuid, window: DayWindow) -> f64 {
    records_in(store, user_id, window)
        .flat_map(|record| record.sleep_sessions.iter())
        .map(|session| session.duration_seconds)
        .sum()
}
