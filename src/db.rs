use anyhow::Context;
use chrono::{Duration, NaiveDate};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{HealthRecord, SleepSession, User};
use crate::store::MemoryStore;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// How an existing user's join date is updated on upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinDate {
    /// Imports keep the earliest date seen for the user.
    KeepEarliest,
    /// Seeding resets the date relative to the seed day.
    Replace,
}

impl JoinDate {
    fn upsert_sql(self) -> &'static str {
        match self {
            JoinDate::KeepEarliest => {
                r#"
                INSERT INTO health_notify.users (id, username, joined_date)
                VALUES ($1, $2, $3)
                ON CONFLICT (username) DO UPDATE
                SET joined_date = LEAST(health_notify.users.joined_date, EXCLUDED.joined_date)
                RETURNING id
                "#
            }
            JoinDate::Replace => {
                r#"
                INSERT INTO health_notify.users (id, username, joined_date)
                VALUES ($1, $2, $3)
                ON CONFLICT (username) DO UPDATE
                SET joined_date = EXCLUDED.joined_date
                RETURNING id
                "#
            }
        }
    }
}

async fn upsert_user(
    pool: &PgPool,
    username: &str,
    joined_date: NaiveDate,
    policy: JoinDate,
) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(policy.upsert_sql())
        .bind(Uuid::new_v4())
        .bind(username)
        .bind(joined_date)
        .fetch_one(pool)
        .await?
        .get("id");

    Ok(id)
}

async fn insert_record(
    pool: &PgPool,
    user_id: Uuid,
    recorded_date: NaiveDate,
    step_count: f64,
    active_energy_burned: f64,
    sleep_sessions: Vec<SleepSession>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO health_notify.health_records
        (id, user_id, recorded_date, step_count, active_energy_burned, sleep_sessions)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(recorded_date)
    .bind(step_count)
    .bind(active_energy_burned)
    .bind(Json(sleep_sessions))
    .execute(pool)
    .await?;

    Ok(())
}

fn sessions(date: NaiveDate, seconds: &[f64]) -> Vec<SleepSession> {
    seconds
        .iter()
        .map(|duration_seconds| SleepSession {
            date,
            duration_seconds: *duration_seconds,
        })
        .collect()
}

/// Replaces the demo users' history with a fixed two-week pattern ending `today`.
pub async fn seed(pool: &PgPool, today: NaiveDate) -> anyhow::Result<()> {
    let days_ago = |days: i64| today - Duration::days(days);

    // Active walker, sleeps well, hits 10k today.
    let avery = upsert_user(pool, "avery", days_ago(120), JoinDate::Replace).await?;
    // Short sleeper whose steps fell off this week.
    let jules = upsert_user(pool, "jules", days_ago(90), JoinDate::Replace).await?;
    // Stopped tracking exactly 30 days ago.
    let kiara = upsert_user(pool, "kiara", days_ago(200), JoinDate::Replace).await?;
    // Signed up 60 days ago and never synced.
    let morgan = upsert_user(pool, "morgan", days_ago(60), JoinDate::Replace).await?;

    for user_id in [avery, jules, kiara, morgan] {
        sqlx::query("DELETE FROM health_notify.health_records WHERE user_id = $1")
            .bind(user_id)
            .execute(pool)
            .await?;
    }

    for day in 0..14 {
        let date = days_ago(day);
        let avery_steps = if day == 0 { 12_400.0 } else { 8_000.0 + (day as f64) * 150.0 };
        insert_record(pool, avery, date, avery_steps, 520.0, sessions(date, &[8.0 * 3600.0]))
            .await?;

        let jules_steps = if day < 7 { 2_100.0 } else { 9_300.0 };
        insert_record(
            pool,
            jules,
            date,
            jules_steps,
            210.0,
            sessions(date, &[3.5 * 3600.0, 0.5 * 3600.0]),
        )
        .await?;
    }

    for day in 30..50 {
        let date = days_ago(day);
        let sleep = if day % 3 == 0 { 8.5 * 3600.0 } else { 6.5 * 3600.0 };
        insert_record(pool, kiara, date, 7_500.0, 430.0, sessions(date, &[sleep])).await?;
    }

    Ok(())
}

pub async fn fetch_snapshot(
    pool: &PgPool,
    since: Option<NaiveDate>,
) -> anyhow::Result<MemoryStore> {
    let users = sqlx::query(
        "SELECT id, username, joined_date FROM health_notify.users ORDER BY username",
    )
    .fetch_all(pool)
    .await
    .context("failed to load users")?
    .into_iter()
    .map(|row| User {
        id: row.get("id"),
        username: row.get("username"),
        joined_date: row.get("joined_date"),
    })
    .collect();

    let rows = sqlx::query(
        r#"
        SELECT id, user_id, recorded_date, step_count, active_energy_burned, sleep_sessions
        FROM health_notify.health_records
        WHERE $1::date IS NULL OR recorded_date >= $1
        "#,
    )
    .bind(since)
    .fetch_all(pool)
    .await
    .context("failed to load health records")?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let id: Uuid = row.get("id");
        let sleep_sessions = match row.try_get::<Json<Vec<SleepSession>>, _>("sleep_sessions") {
            Ok(Json(sessions)) => sessions,
            Err(err) => {
                tracing::warn!(record_id = %id, error = %err, "malformed sleep sessions; treating as none");
                Vec::new()
            }
        };
        records.push(HealthRecord {
            id,
            user_id: row.get("user_id"),
            recorded_date: row.get("recorded_date"),
            step_count: row.get("step_count"),
            active_energy_burned: row.get("active_energy_burned"),
            sleep_sessions,
        });
    }

    Ok(MemoryStore::new(users, records))
}

#[derive(Debug, serde::Deserialize)]
struct CsvRow {
    username: String,
    joined_date: NaiveDate,
    recorded_date: NaiveDate,
    step_count: f64,
    active_energy_burned: f64,
    /// Semicolon-separated session durations in seconds
    sleep_seconds: Option<String>,
}

fn parse_sleep_seconds(raw: Option<&str>) -> anyhow::Result<Vec<f64>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    raw.split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| -> anyhow::Result<f64> {
            let seconds: f64 = part
                .parse()
                .with_context(|| format!("invalid sleep duration: {part}"))?;
            anyhow::ensure!(
                seconds.is_finite() && seconds >= 0.0,
                "sleep duration must be non-negative: {part}"
            );
            Ok(seconds)
        })
        .collect()
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let line = index + 2;
        let row = result.with_context(|| format!("invalid row at line {line}"))?;
        anyhow::ensure!(
            row.step_count >= 0.0 && row.active_energy_burned >= 0.0,
            "negative metric at line {line}"
        );
        let sleep = parse_sleep_seconds(row.sleep_seconds.as_deref())
            .with_context(|| format!("invalid sleep_seconds at line {line}"))?;

        let user_id =
            upsert_user(pool, &row.username, row.joined_date, JoinDate::KeepEarliest).await?;
        insert_record(
            pool,
            user_id,
            row.recorded_date,
            row.step_count,
            row.active_energy_burned,
            sessions(row.recorded_date, &sleep),
        )
        .await?;
        inserted += 1;
    }

    Ok(inserted)
}
