use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::cohort::{classify_all, AbsenceClassifier, CohortConfig};
use crate::milestone;
use crate::models::{CohortKind, CohortResult};
use crate::store::{MemoryStore, RecordStore};
use crate::window;

fn describe(result: &CohortResult) -> String {
    match result.kind {
        CohortKind::LowSleep => format!("{:.1} h average sleep", result.metric_value / 3600.0),
        CohortKind::HighSteps => format!("{:.0} steps today", result.metric_value),
        CohortKind::StepDrop => format!("{:.0} steps last week", result.metric_value),
        CohortKind::Absence => format!("{:.0} days absent", result.metric_value),
    }
}

pub fn build_report(
    store: &MemoryStore,
    now: DateTime<Utc>,
    config: &CohortConfig,
    top: usize,
) -> String {
    let cohorts = classify_all(store, now, config);
    let today = window::today(now);
    let username = |result: &CohortResult| {
        store
            .user(result.user_id)
            .map(|user| user.username.clone())
            .unwrap_or_else(|| result.user_id.to_string())
    };

    let mut output = String::new();

    let _ = writeln!(output, "# Health Cohort Report");
    let _ = writeln!(
        output,
        "Generated for {} ({} users)",
        today,
        store.all_users().len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Cohort Sizes");

    for (kind, results) in cohorts.iter() {
        let _ = writeln!(output, "- {}: {} users", kind, results.len());
    }

    for (kind, results) in cohorts.iter() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## {}", kind.topic());

        if results.is_empty() {
            let _ = writeln!(output, "No users in this cohort.");
            continue;
        }

        for result in results.iter().take(top) {
            let _ = writeln!(output, "- {}: {}", username(result), describe(result));
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Absence Milestones");

    let absent = cohorts
        .get(&CohortKind::Absence)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    if absent.is_empty() {
        let _ = writeln!(output, "No users reached an absence milestone today.");
    } else {
        for result in absent.iter().take(top) {
            let summary = milestone::summarize_absence(
                store,
                result.user_id,
                result.metric_value as i64,
                config.perfect_night,
            );
            let _ = writeln!(
                output,
                "- {} away {} days: {:.0} steps, {:.0} active calories, {} perfect nights",
                username(result),
                summary.days_absent,
                summary.total_steps,
                summary.total_calories,
                summary.perfect_sleep_nights
            );
        }
    }

    let duplicates = store.duplicate_days();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Data Quality");

    if duplicates.is_empty() {
        let _ = writeln!(output, "No duplicate day records found.");
    } else {
        for duplicate in duplicates.iter() {
            let name = store
                .user(duplicate.user_id)
                .map(|user| user.username.as_str())
                .unwrap_or("unknown user");
            let _ = writeln!(
                output,
                "- {} has {} records on {}",
                name, duplicate.count, duplicate.recorded_date
            );
        }
    }

    let quiet = store
        .all_users()
        .iter()
        .filter(|user| AbsenceClassifier::days_absent(store, user, today) > 0)
        .count();
    let _ = writeln!(output);
    let _ = writeln!(output, "{} users have not synced today.", quiet);

    output
}
