use thiserror::Error;

use crate::gateway::GatewayError;

/// Ошибки ядра опроса.
#[derive(Debug, Error)]
pub enum SurveyError {
    #[error("access denied")]
    Forbidden,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("database error: {0}")]
    Transient(#[from] sqlx::Error),
    #[error("chat transport error: {0}")]
    Transport(#[from] GatewayError),
    #[error("corrupted JSON column: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl SurveyError {
    pub fn session_not_found() -> Self {
        SurveyError::NotFound("Сессия не найдена.".to_string())
    }

    /// Текст для пользователя. `None` для ошибок, которые только логируются.
    pub fn user_message(&self) -> Option<String> {
        match self {
            SurveyError::Forbidden => Some("Доступ запрещён.".to_string()),
            SurveyError::NotFound(msg) | SurveyError::Invalid(msg) => Some(msg.clone()),
            _ => None,
        }
    }
}
