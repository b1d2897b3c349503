use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cohort;
mod composer;
mod config;
mod db;
mod milestone;
mod models;
mod notify;
mod report;
mod store;
mod window;

use cohort::CohortConfig;
use composer::{Composer, HttpComposer, TemplateComposer};
use models::CohortKind;
use store::RecordStore;

#[derive(Parser)]
#[command(name = "health-cohort-notifier")]
#[command(about = "Classify users into health cohorts and compose notifications", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Thresholds {
    /// Evaluate as of this date instead of now (YYYY-MM-DD)
    #[arg(long)]
    as_of: Option<NaiveDate>,
    /// Average nightly sleep below this many hours counts as low sleep
    #[arg(long, default_value_t = 6.0)]
    min_sleep_hours: f64,
    /// Leave users with no records in the sleep window out of the low-sleep cohort
    #[arg(long)]
    exclude_users_with_no_data: bool,
    #[arg(long, default_value_t = 10_000.0)]
    step_goal: f64,
    #[arg(long, default_value_t = 30)]
    absence_period_days: i64,
    /// Count a perfect night when any sleep session reaches 8 hours, not just the first
    #[arg(long)]
    any_session_perfect: bool,
}

impl Thresholds {
    fn now(&self) -> DateTime<Utc> {
        match self.as_of.and_then(|date| date.and_hms_opt(12, 0, 0)) {
            Some(noon) => noon.and_utc(),
            None => Utc::now(),
        }
    }

    fn cohort_config(&self) -> CohortConfig {
        CohortConfig {
            min_avg_sleep_seconds: self.min_sleep_hours * cohort::SECONDS_PER_HOUR,
            exclude_users_with_no_data: self.exclude_users_with_no_data,
            high_step_threshold: self.step_goal,
            absence_period_days: self.absence_period_days,
            perfect_night: if self.any_session_perfect {
                milestone::any_session_is_perfect
            } else {
                milestone::first_session_is_perfect
            },
            ..CohortConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo users and two weeks of records
    Seed,
    /// Import daily health records from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// List the members of a cohort
    Cohort {
        #[arg(long, value_enum)]
        kind: CohortKind,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[command(flatten)]
        thresholds: Thresholds,
    },
    /// Compose notifications for a cohort and print them as JSON
    Notify {
        #[arg(long, value_enum)]
        kind: CohortKind,
        #[arg(long)]
        limit: Option<usize>,
        /// Maximum composer requests in flight
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        #[command(flatten)]
        thresholds: Thresholds,
    },
    /// Generate a markdown report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        #[arg(long, default_value_t = 10)]
        top: usize,
        #[command(flatten)]
        thresholds: Thresholds,
    },
}

/// Earliest day any windowed cohort looks at; absence needs full history.
fn snapshot_since(
    kind: CohortKind,
    config: &CohortConfig,
    now: DateTime<Utc>,
) -> Option<NaiveDate> {
    let today = window::today(now);
    match kind {
        CohortKind::Absence => None,
        CohortKind::LowSleep => Some(today - Duration::days(config.sleep_window_days)),
        CohortKind::HighSteps => Some(today),
        CohortKind::StepDrop => Some(today - Duration::days(config.step_window_days * 2)),
    }
}

fn build_composer(settings: &config::Settings) -> anyhow::Result<Arc<dyn Composer>> {
    match &settings.composer {
        Some(http) => {
            tracing::info!(url = %http.base_url, model = %http.model, "using remote composer");
            let composer =
                HttpComposer::new(http.clone()).context("failed to build composer client")?;
            Ok(Arc::new(composer))
        }
        None => {
            tracing::info!("COMPOSER_URL not set; using template composer");
            Ok(Arc::new(TemplateComposer))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "health_cohort_notifier=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = config::Settings::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool, Utc::now().date_naive()).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} records from {}.", csv.display());
        }
        Commands::Cohort {
            kind,
            limit,
            thresholds,
        } => {
            let now = thresholds.now();
            let config = thresholds.cohort_config();
            let store = db::fetch_snapshot(&pool, snapshot_since(kind, &config, now)).await?;
            let results = cohort::classifier_for(kind, &config).classify(
                &store,
                store.all_users(),
                now,
            );

            if results.is_empty() {
                println!("No users in the {kind} cohort.");
                return Ok(());
            }

            println!("{} users in the {kind} cohort:", results.len());
            for result in results.iter().take(limit) {
                let name = store
                    .user(result.user_id)
                    .map(|user| user.username.as_str())
                    .unwrap_or("unknown user");
                println!("- {} ({:.1})", name, result.metric_value);
            }
        }
        Commands::Notify {
            kind,
            limit,
            concurrency,
            thresholds,
        } => {
            let now = thresholds.now();
            let config = thresholds.cohort_config();
            // Milestone totals cover the whole history, so absence loads everything.
            let store = db::fetch_snapshot(&pool, snapshot_since(kind, &config, now)).await?;
            let composer = build_composer(&settings)?;
            let options = notify::DispatchOptions {
                limit,
                max_in_flight: concurrency,
            };

            let notifications =
                notify::dispatch(&store, composer, kind, now, &config, &options).await;
            println!("{}", serde_json::to_string_pretty(&notifications)?);
        }
        Commands::Report {
            out,
            top,
            thresholds,
        } => {
            let now = thresholds.now();
            let store = db::fetch_snapshot(&pool, None).await?;
            let report = report::build_report(&store, now, &thresholds.cohort_config(), top);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(as_of: Option<NaiveDate>) -> Thresholds {
        Thresholds {
            as_of,
            min_sleep_hours: 6.0,
            exclude_users_with_no_data: false,
            step_goal: 10_000.0,
            absence_period_days: 30,
            any_session_perfect: false,
        }
    }

    #[test]
    fn as_of_pins_the_clock() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();
        assert_eq!(window::today(thresholds(Some(date)).now()), date);
    }

    #[test]
    fn snapshot_push_down_covers_each_window() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();
        let now = thresholds(Some(date)).now();
        let config = CohortConfig::default();

        assert_eq!(snapshot_since(CohortKind::Absence, &config, now), None);
        assert_eq!(snapshot_since(CohortKind::HighSteps, &config, now), Some(date));
        assert_eq!(
            snapshot_since(CohortKind::StepDrop, &config, now),
            Some(date - Duration::days(14))
        );
        assert_eq!(
            snapshot_since(CohortKind::LowSleep, &config, now),
            Some(date - Duration::days(7))
        );
    }

    #[test]
    fn cli_parses_notify_flags() {
        let cli = Cli::try_parse_from([
            "health-cohort-notifier",
            "notify",
            "--kind",
            "low-sleep",
            "--exclude-users-with-no-data",
            "--as-of",
            "2026-03-15",
        ])
        .expect("valid arguments");

        match cli.command {
            Commands::Notify {
                kind, thresholds, ..
            } => {
                assert_eq!(kind, CohortKind::LowSleep);
                assert!(thresholds.cohort_config().exclude_users_with_no_data);
            }
            _ => panic!("expected notify"),
        }
    }
}
