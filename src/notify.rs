use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::cohort::{classifier_for, CohortConfig};
use crate::composer::{Composer, ComposerError, MetricPayload};
use crate::milestone;
use crate::models::{CohortKind, User};
use crate::store::RecordStore;

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub user_id: Uuid,
    pub username: String,
    pub cohort: CohortKind,
    pub message: String,
    /// Set when the composer failed and `message` is the fallback text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub limit: Option<usize>,
    pub max_in_flight: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            limit: None,
            max_in_flight: 4,
        }
    }
}

/// A classified user paired with the payload handed to the composer.
#[derive(Debug, Clone)]
pub struct Job {
    pub user: User,
    pub cohort: CohortKind,
    pub payload: MetricPayload,
}

/// Classifies users and, for absence, attaches lifetime milestone totals.
pub fn build_jobs(
    store: &dyn RecordStore,
    kind: CohortKind,
    now: DateTime<Utc>,
    config: &CohortConfig,
    limit: Option<usize>,
) -> Vec<Job> {
    let users: HashMap<Uuid, &User> = store
        .all_users()
        .iter()
        .map(|user| (user.id, user))
        .collect();
    let results = classifier_for(kind, config).classify(store, store.all_users(), now);

    results
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .filter_map(|result| {
            let user = (*users.get(&result.user_id)?).clone();
            let payload = match kind {
                CohortKind::Absence => MetricPayload::Absence(milestone::summarize_absence(
                    store,
                    result.user_id,
                    result.metric_value as i64,
                    config.perfect_night,
                )),
                _ => MetricPayload::Cohort(result),
            };
            Some(Job {
                user,
                cohort: kind,
                payload,
            })
        })
        .collect()
}

/// Composes one notification per job. Composer failures become tagged fallback messages.
pub async fn compose_all(
    jobs: Vec<Job>,
    composer: Arc<dyn Composer>,
    max_in_flight: usize,
) -> Vec<Notification> {
    let semaphore = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let mut tasks = JoinSet::new();
    // Users whose task has not yet returned a notification.
    let mut pending: HashMap<Uuid, (User, CohortKind)> = jobs
        .iter()
        .map(|job| (job.user.id, (job.user.clone(), job.cohort)))
        .collect();

    for job in jobs {
        let composer = Arc::clone(&composer);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            compose_one(composer.as_ref(), job).await
        });
    }

    let mut notifications = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(notification) => {
                pending.remove(&notification.user_id);
                notifications.push(notification);
            }
            Err(err) => tracing::error!(error = %err, "notification task aborted"),
        }
    }

    for (_, (user, cohort)) in pending {
        let err = ComposerError::Panicked;
        notifications.push(Notification {
            user_id: user.id,
            message: fallback_message(&user, cohort, &err),
            username: user.username,
            cohort,
            failure: Some(err.to_string()),
        });
    }

    notifications.sort_by(|a, b| a.username.cmp(&b.username));
    notifications
}

pub async fn dispatch(
    store: &dyn RecordStore,
    composer: Arc<dyn Composer>,
    kind: CohortKind,
    now: DateTime<Utc>,
    config: &CohortConfig,
    options: &DispatchOptions,
) -> Vec<Notification> {
    let jobs = build_jobs(store, kind, now, config, options.limit);
    tracing::info!(cohort = %kind, users = jobs.len(), "composing notifications");

    let notifications = compose_all(jobs, composer, options.max_in_flight).await;
    let failed = notifications
        .iter()
        .filter(|notification| notification.failure.is_some())
        .count();
    if failed > 0 {
        tracing::warn!(cohort = %kind, failed, "some notifications fell back to placeholder text");
    }
    notifications
}

async fn compose_one(composer: &dyn Composer, job: Job) -> Notification {
    let topic = job.cohort.topic();
    let (message, failure) = match composer.compose(&job.user, &job.payload, topic).await {
        Ok(message) => (message, None),
        Err(err) => {
            tracing::warn!(user = %job.user.username, cohort = %job.cohort, error = %err, "composer failed");
            (fallback_message(&job.user, job.cohort, &err), Some(err.to_string()))
        }
    };

    Notification {
        user_id: job.user.id,
        username: job.user.username,
        cohort: job.cohort,
        message,
        failure,
    }
}

pub fn fallback_message(user: &User, cohort: CohortKind, err: &ComposerError) -> String {
    format!(
        "[composer error: {err}] Hi {}, we have an update about {}.",
        user.username,
        cohort.topic()
    )
}
