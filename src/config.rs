use anyhow::Context;

use crate::composer::HttpComposerConfig;

/// Process settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    /// `None` selects the offline template composer.
    pub composer: Option<HttpComposerConfig>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        Ok(Self {
            database_url,
            composer: composer_from_env()?,
        })
    }
}

fn composer_from_env() -> anyhow::Result<Option<HttpComposerConfig>> {
    let Ok(base_url) = std::env::var("COMPOSER_URL") else {
        return Ok(None);
    };

    let defaults = HttpComposerConfig::default();
    let request_timeout_ms = match std::env::var("COMPOSER_TIMEOUT_MS") {
        Ok(value) => value
            .parse()
            .with_context(|| format!("COMPOSER_TIMEOUT_MS is not a number: {value}"))?,
        Err(_) => defaults.request_timeout_ms,
    };

    Ok(Some(HttpComposerConfig {
        base_url,
        api_key: std::env::var("COMPOSER_API_KEY").ok(),
        model: std::env::var("COMPOSER_MODEL").unwrap_or(defaults.model),
        request_timeout_ms,
    }))
}
