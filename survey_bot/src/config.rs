use anyhow::{Context, bail};
use std::path::PathBuf;

const DEFAULT_DATABASE_URL: &str = "sqlite://data/survey.db";

/// Настройки процесса из окружения (и `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub bot_username: String,
    pub admin_bootstrap: Option<i64>,
    pub survey_path: Option<PathBuf>,
    pub database_url: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let Some(bot_token) = var("BOT_TOKEN") else {
            bail!("BOT_TOKEN is not set");
        };
        let admin_bootstrap = var("ADMIN_BOOTSTRAP")
            .map(|raw| raw.parse::<i64>().with_context(|| format!("ADMIN_BOOTSTRAP is not a number: {raw}")))
            .transpose()?;

        Ok(Config {
            bot_token,
            bot_username: var("BOT_USERNAME").unwrap_or_default().trim_start_matches('@').to_string(),
            admin_bootstrap,
            survey_path: var("SURVEY_PATH").map(PathBuf::from),
            database_url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
        })
    }
}
