use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::milestone::{self, PerfectNightPolicy};
use crate::models::{CohortKind, CohortResult, User};
use crate::store::RecordStore;
use crate::window::{self, DayWindow};

pub const SECONDS_PER_HOUR: f64 = 3600.0;

#[derive(Debug, Clone)]
pub struct CohortConfig {
    pub sleep_window_days: i64,
    pub min_avg_sleep_seconds: f64,
    /// Skip users with no records in the sleep window instead of treating them as 0s of sleep.
    pub exclude_users_with_no_data: bool,
    pub high_step_threshold: f64,
    pub step_window_days: i64,
    /// Last week qualifies when below this fraction of the week before.
    pub step_drop_ratio: f64,
    pub absence_period_days: i64,
    /// Rule for counting perfect nights in absence milestones.
    pub perfect_night: PerfectNightPolicy,
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            sleep_window_days: 7,
            min_avg_sleep_seconds: 6.0 * SECONDS_PER_HOUR,
            exclude_users_with_no_data: false,
            high_step_threshold: 10_000.0,
            step_window_days: 7,
            step_drop_ratio: 0.5,
            absence_period_days: 30,
            perfect_night: milestone::first_session_is_perfect,
        }
    }
}

pub trait Classifier: Send + Sync {
    fn kind(&self) -> CohortKind;

    fn classify(
        &self,
        store: &dyn RecordStore,
        users: &[User],
        now: DateTime<Utc>,
    ) -> Vec<CohortResult>;
}

pub struct LowSleepClassifier {
    pub window_days: i64,
    pub min_avg_sleep_seconds: f64,
    pub exclude_users_with_no_data: bool,
}

impl Classifier for LowSleepClassifier {
    fn kind(&self) -> CohortKind {
        CohortKind::LowSleep
    }

    fn classify(
        &self,
        store: &dyn RecordStore,
        users: &[User],
        now: DateTime<Utc>,
    ) -> Vec<CohortResult> {
        let span = DayWindow::trailing(window::today(now), self.window_days);
        let days = span.len_days().max(1) as f64;
        let mut results = Vec::new();

        for user in unique(users) {
            if self.exclude_users_with_no_data
                && window::records_in(store, user.id, span).next().is_none()
            {
                continue;
            }

            // Averaged over calendar days, so missing nights count as zero sleep.
            let average = window::total_sleep_seconds(store, user.id, span) / days;
            if average < self.min_avg_sleep_seconds {
                results.push(CohortResult {
                    user_id: user.id,
                    kind: self.kind(),
                    metric_value: average,
                });
            }
        }

        rank(results, false)
    }
}

pub struct HighStepClassifier {
    pub threshold: f64,
}

impl Classifier for HighStepClassifier {
    fn kind(&self) -> CohortKind {
        CohortKind::HighSteps
    }

    fn classify(
        &self,
        store: &dyn RecordStore,
        users: &[User],
        now: DateTime<Utc>,
    ) -> Vec<CohortResult> {
        let today = window::today(now);
        let mut results = Vec::new();

        for user in unique(users) {
            let best = store
                .records_for_user(user.id)
                .iter()
                .filter(|record| record.recorded_date == today)
                .map(|record| record.step_count)
                .filter(|steps| *steps >= self.threshold)
                .fold(None, |best: Option<f64>, steps| {
                    Some(best.map_or(steps, |current| current.max(steps)))
                });

            if let Some(steps) = best {
                results.push(CohortResult {
                    user_id: user.id,
                    kind: self.kind(),
                    metric_value: steps,
                });
            }
        }

        rank(results, true)
    }
}

pub struct StepDropClassifier {
    pub window_days: i64,
    pub ratio: f64,
}

impl StepDropClassifier {
    /// Steps in the last window and in the window before it.
    fn weekly_steps(
        &self,
        store: &dyn RecordStore,
        user_id: Uuid,
        today: NaiveDate,
    ) -> (f64, f64) {
        let last = DayWindow::ending_before(today, self.window_days);
        let before = DayWindow::ending_before(last.start, self.window_days);
        (
            window::sum_steps(store, user_id, last),
            window::sum_steps(store, user_id, before),
        )
    }
}

impl Classifier for StepDropClassifier {
    fn kind(&self) -> CohortKind {
        CohortKind::StepDrop
    }

    fn classify(
        &self,
        store: &dyn RecordStore,
        users: &[User],
        now: DateTime<Utc>,
    ) -> Vec<CohortResult> {
        let today = window::today(now);
        let mut results = Vec::new();

        for user in unique(users) {
            let (last_week, week_before) = self.weekly_steps(store, user.id, today);
            // No prior-week data never qualifies.
            if week_before > 0.0 && last_week < week_before * self.ratio {
                results.push(CohortResult {
                    user_id: user.id,
                    kind: self.kind(),
                    metric_value: last_week,
                });
            }
        }

        rank(results, false)
    }
}

pub struct AbsenceClassifier {
    pub period_days: i64,
}

impl AbsenceClassifier {
    /// Whole days since the latest record, or since joining when there is none.
    pub fn days_absent(store: &dyn RecordStore, user: &User, today: NaiveDate) -> i64 {
        let last_seen = store
            .records_for_user(user.id)
            .iter()
            .map(|record| record.recorded_date)
            .max()
            .unwrap_or(user.joined_date);
        (today - last_seen).num_days()
    }

    fn is_milestone(&self, days_absent: i64) -> bool {
        self.period_days > 0 && days_absent > 0 && days_absent % self.period_days == 0
    }
}

impl Classifier for AbsenceClassifier {
    fn kind(&self) -> CohortKind {
        CohortKind::Absence
    }

    fn classify(
        &self,
        store: &dyn RecordStore,
        users: &[User],
        now: DateTime<Utc>,
    ) -> Vec<CohortResult> {
        let today = window::today(now);
        let mut results = Vec::new();

        for user in unique(users) {
            let days_absent = Self::days_absent(store, user, today);
            if self.is_milestone(days_absent) {
                results.push(CohortResult {
                    user_id: user.id,
                    kind: self.kind(),
                    metric_value: days_absent as f64,
                });
            }
        }

        rank(results, true)
    }
}

pub fn classifier_for(kind: CohortKind, config: &CohortConfig) -> Box<dyn Classifier> {
    match kind {
        CohortKind::LowSleep => Box::new(LowSleepClassifier {
            window_days: config.sleep_window_days,
            min_avg_sleep_seconds: config.min_avg_sleep_seconds,
            exclude_users_with_no_data: config.exclude_users_with_no_data,
        }),
        CohortKind::HighSteps => Box::new(HighStepClassifier {
            threshold: config.high_step_threshold,
        }),
        CohortKind::StepDrop => Box::new(StepDropClassifier {
            window_days: config.step_window_days,
            ratio: config.step_drop_ratio,
        }),
        CohortKind::Absence => Box::new(AbsenceClassifier {
            period_days: config.absence_period_days,
        }),
    }
}

/// Runs every classifier over all users of the store, one thread per classifier.
pub fn classify_all(
    store: &dyn RecordStore,
    now: DateTime<Utc>,
    config: &CohortConfig,
) -> BTreeMap<CohortKind, Vec<CohortResult>> {
    let users = store.all_users();

    std::thread::scope(|scope| {
        let handles: Vec<_> = CohortKind::ALL
            .iter()
            .map(|kind| {
                let classifier = classifier_for(*kind, config);
                (
                    *kind,
                    scope.spawn(move || classifier.classify(store, users, now)),
                )
            })
            .collect();

        let mut cohorts = BTreeMap::new();
        for (kind, handle) in handles {
            match handle.join() {
                Ok(results) => {
                    tracing::debug!(cohort = %kind, members = results.len(), "cohort classified");
                    cohorts.insert(kind, results);
                }
                Err(_) => {
                    tracing::error!(cohort = %kind, "classifier panicked; cohort left empty");
                    cohorts.insert(kind, Vec::new());
                }
            }
        }
        cohorts
    })
}

fn unique(users: &[User]) -> impl Iterator<Item = &User> {
    let mut seen = HashSet::new();
    users.iter().filter(move |user| seen.insert(user.id))
}

fn rank(mut results: Vec<CohortResult>, descending: bool) -> Vec<CohortResult> {
    results.sort_by(|a, b| {
        let order = a
            .metric_value
            .partial_cmp(&b.metric_value)
            .unwrap_or(std::cmp::Ordering::Equal);
        let order = if descending { order.reverse() } else { order };
        order.then(a.user_id.cmp(&b.user_id))
    });
    results
}

#[cfg(test)]
mod tests {
    use super::{
        classify_all, AbsenceClassifier, Classifier, CohortConfig, HighStepClassifier,
        LowSleepClassifier, StepDropClassifier,
    };
    use crate::models::{CohortKind, User};
    use crate::store::fixtures::*;
    use crate::store::{MemoryStore, RecordStore};
    use pretty_assertions::assert_eq;

    fn low_sleep(exclude_users_with_no_data: bool) -> LowSleepClassifier {
        LowSleepClassifier {
            window_days: 7,
            min_avg_sleep_seconds: 21600.0,
            exclude_users_with_no_data,
        }
    }

    fn step_drop() -> StepDropClassifier {
        StepDropClassifier {
            window_days: 7,
            ratio: 0.5,
        }
    }

    fn absence() -> AbsenceClassifier {
        AbsenceClassifier { period_days: 30 }
    }

    fn member_ids(results: &[crate::models::CohortResult]) -> Vec<uuid::Uuid> {
        results.iter().map(|result| result.user_id).collect()
    }

    #[test]
    fn one_hour_nights_for_a_week_is_low_sleep() {
        let avery = user("avery", 60);
        let records = (0..7)
            .map(|day| record(&avery, days_ago(day), 5000.0, 100.0, &[3600.0]))
            .collect();
        let store = MemoryStore::new(vec![avery.clone()], records);

        let results = low_sleep(false).classify(&store, store.all_users(), now());

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].user_id, avery.id);
        assert_eq!(results[0].kind, CohortKind::LowSleep);
        assert_eq!(results[0].metric_value, 3600.0);
    }

    #[test]
    fn eight_hour_nights_are_not_low_sleep() {
        let avery = user("avery", 60);
        let records = (0..7)
            .map(|day| record(&avery, days_ago(day), 5000.0, 100.0, &[28800.0]))
            .collect();
        let store = MemoryStore::new(vec![avery], records);

        assert!(low_sleep(false)
            .classify(&store, store.all_users(), now())
            .is_empty());
    }

    #[test]
    fn sleep_outside_the_week_is_ignored() {
        let avery = user("avery", 60);
        let store = MemoryStore::new(
            vec![avery.clone()],
            vec![
                record(&avery, days_ago(7), 0.0, 0.0, &[1_000_000.0]),
                record(&avery, days_ago(6), 0.0, 0.0, &[7.0 * 3600.0]),
            ],
        );

        let results = low_sleep(false).classify(&store, store.all_users(), now());

        assert_eq!(member_ids(&results), vec![avery.id]);
        assert_eq!(results[0].metric_value, 3600.0);
    }

    #[test]
    fn user_without_records_counts_as_low_sleep_by_default() {
        let newcomer = user("newcomer", 0);
        let store = MemoryStore::new(vec![newcomer.clone()], vec![]);

        let results = low_sleep(false).classify(&store, store.all_users(), now());
        assert_eq!(member_ids(&results), vec![newcomer.id]);
        assert_eq!(results[0].metric_value, 0.0);

        let excluded = low_sleep(true).classify(&store, store.all_users(), now());
        assert!(excluded.is_empty());
    }

    #[test]
    fn exclusion_flag_keeps_users_with_data() {
        let avery = user("avery", 60);
        let store = MemoryStore::new(
            vec![avery.clone()],
            vec![record(&avery, days_ago(2), 0.0, 0.0, &[])],
        );

        let results = low_sleep(true).classify(&store, store.all_users(), now());
        assert_eq!(member_ids(&results), vec![avery.id]);
    }

    #[test]
    fn high_steps_deduplicates_same_day_records() {
        let avery = user("avery", 60);
        let store = MemoryStore::new(
            vec![avery.clone()],
            vec![
                record(&avery, today(), 12000.0, 0.0, &[]),
                record(&avery, today(), 500.0, 0.0, &[]),
            ],
        );

        let results = HighStepClassifier { threshold: 10000.0 }.classify(
            &store,
            store.all_users(),
            now(),
        );

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].user_id, avery.id);
        assert_eq!(results[0].metric_value, 12000.0);
    }

    #[test]
    fn high_steps_only_counts_today() {
        let avery = user("avery", 60);
        let jules = user("jules", 60);
        let store = MemoryStore::new(
            vec![avery.clone(), jules.clone()],
            vec![
                record(&avery, days_ago(1), 25000.0, 0.0, &[]),
                record(&jules, today(), 10000.0, 0.0, &[]),
            ],
        );

        let results = HighStepClassifier { threshold: 10000.0 }.classify(
            &store,
            store.all_users(),
            now(),
        );

        assert_eq!(member_ids(&results), vec![jules.id]);
    }

    #[test]
    fn duplicated_user_list_yields_one_result() {
        let avery = user("avery", 60);
        let store = MemoryStore::new(
            vec![avery.clone()],
            vec![record(&avery, today(), 15000.0, 0.0, &[])],
        );
        let users: Vec<User> = vec![avery.clone(), avery.clone()];

        let results = HighStepClassifier { threshold: 10000.0 }.classify(&store, &users, now());
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn step_drop_requires_more_than_half_lost() {
        let dropped = user("dropped", 60);
        let steady = user("steady", 60);
        let mut records = Vec::new();
        for day in 1..=7 {
            records.push(record(&dropped, days_ago(day), 1000.0, 0.0, &[]));
            records.push(record(&dropped, days_ago(day + 7), 5000.0, 0.0, &[]));
            records.push(record(&steady, days_ago(day), 4000.0, 0.0, &[]));
            records.push(record(&steady, days_ago(day + 7), 5000.0, 0.0, &[]));
        }
        let store = MemoryStore::new(vec![dropped.clone(), steady.clone()], records);

        let results = step_drop().classify(&store, store.all_users(), now());

        assert_eq!(member_ids(&results), vec![dropped.id]);
        assert_eq!(results[0].metric_value, 7000.0);
    }

    #[test]
    fn step_drop_windows_exclude_today() {
        let avery = user("avery", 60);
        let store = MemoryStore::new(
            vec![avery.clone()],
            vec![
                record(&avery, today(), 50000.0, 0.0, &[]),
                record(&avery, days_ago(7), 100.0, 0.0, &[]),
                record(&avery, days_ago(8), 10000.0, 0.0, &[]),
                record(&avery, days_ago(14), 10000.0, 0.0, &[]),
                record(&avery, days_ago(15), 90000.0, 0.0, &[]),
            ],
        );

        let (last_week, week_before) = step_drop().weekly_steps(&store, avery.id, today());
        assert_eq!(last_week, 100.0);
        assert_eq!(week_before, 20000.0);
    }

    #[test]
    fn step_drop_never_matches_without_prior_week() {
        let idle = user("idle", 60);
        let fresh = user("fresh", 60);
        let store = MemoryStore::new(
            vec![idle.clone(), fresh.clone()],
            vec![record(&fresh, days_ago(2), 3000.0, 0.0, &[])],
        );

        assert!(step_drop()
            .classify(&store, store.all_users(), now())
            .is_empty());
    }

    #[test]
    fn absence_surfaces_multiples_of_thirty() {
        let cases = [(30, true), (31, false), (60, true), (0, false), (29, false)];

        for (days, expected) in cases {
            let member = user("member", 400);
            let store = MemoryStore::new(
                vec![member.clone()],
                vec![record(&member, days_ago(days), 100.0, 10.0, &[])],
            );

            let results = absence().classify(&store, store.all_users(), now());
            assert_eq!(!results.is_empty(), expected, "days absent = {days}");
            if expected {
                assert_eq!(results[0].metric_value, days as f64);
            }
        }
    }

    #[test]
    fn latest_record_beats_join_date() {
        let member = user("member", 40);
        let store = MemoryStore::new(
            vec![member.clone()],
            vec![record(&member, days_ago(35), 4000.0, 200.0, &[])],
        );

        assert_eq!(AbsenceClassifier::days_absent(&store, &member, today()), 35);
        assert!(absence()
            .classify(&store, store.all_users(), now())
            .is_empty());
    }

    #[test]
    fn absence_uses_latest_record() {
        let member = user("member", 400);
        let store = MemoryStore::new(
            vec![member.clone()],
            vec![
                record(&member, days_ago(90), 100.0, 10.0, &[]),
                record(&member, days_ago(35), 100.0, 10.0, &[]),
                record(&member, days_ago(60), 100.0, 10.0, &[]),
            ],
        );

        assert_eq!(AbsenceClassifier::days_absent(&store, &member, today()), 35);
        assert!(absence()
            .classify(&store, store.all_users(), now())
            .is_empty());
    }

    #[test]
    fn absence_without_records_counts_from_joining() {
        let joined_long_ago = user("joined", 60);
        let joined_today = user("today", 0);
        let store = MemoryStore::new(vec![joined_long_ago.clone(), joined_today], vec![]);

        let results = absence().classify(&store, store.all_users(), now());
        assert_eq!(member_ids(&results), vec![joined_long_ago.id]);
        assert_eq!(results[0].metric_value, 60.0);
    }

    #[test]
    fn classify_all_fills_every_cohort() {
        let sleeper = user("sleeper", 60);
        let store = MemoryStore::new(
            vec![sleeper.clone()],
            vec![record(&sleeper, today(), 11000.0, 0.0, &[3600.0])],
        );

        let cohorts = classify_all(&store, now(), &CohortConfig::default());

        assert_eq!(cohorts.len(), 4);
        assert_eq!(member_ids(&cohorts[&CohortKind::LowSleep]), vec![sleeper.id]);
        assert_eq!(member_ids(&cohorts[&CohortKind::HighSteps]), vec![sleeper.id]);
        assert!(cohorts[&CohortKind::StepDrop].is_empty());
        assert!(cohorts[&CohortKind::Absence].is_empty());
    }
}
