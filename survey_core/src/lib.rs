pub mod admin;
pub mod callback;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod questionnaire;
pub mod render;
pub mod stats;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub use error::SurveyError;
pub use questionnaire::{Choice, Question, QuestionKind, Survey, OTHER_PREFIX};

/// Данные пользователя из входящего апдейта.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub tg_id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub tg_id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
    Draft,
    Completed,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Response {
    pub id: i64,
    pub user_id: i64,
    pub status: ResponseStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Элемент незавершённого MULTI-выбора.
///
/// Хранится строкой: id опции как есть, свободный текст с префиксом «Другое: ».
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Selection {
    Picked(String),
    Other(String),
}

impl From<String> for Selection {
    fn from(raw: String) -> Self {
        match raw.strip_prefix(OTHER_PREFIX) {
            Some(text) => Selection::Other(text.to_string()),
            None => Selection::Picked(raw),
        }
    }
}

impl From<Selection> for String {
    fn from(selection: Selection) -> Self {
        match selection {
            Selection::Picked(id) => id,
            Selection::Other(text) => format!("{OTHER_PREFIX}{text}"),
        }
    }
}

impl Selection {
    /// Подпись для ответа: текст опции или «Другое: …».
    pub fn label(&self, question: &Question) -> String {
        match self {
            Selection::Picked(id) => question.option_label(id).to_string(),
            Selection::Other(text) => format!("{OTHER_PREFIX}{text}"),
        }
    }
}

/// Значение ответа: ровно одно из текста или списка подписей.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerValue {
    Text(String),
    Options(Vec<String>),
}

impl AnswerValue {
    pub fn display(&self) -> String {
        match self {
            AnswerValue::Text(text) => text.clone(),
            AnswerValue::Options(labels) => labels.join(", "),
        }
    }
}

/// Курсор пользователя внутри черновика анкеты.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub response_id: i64,
    pub current_q_index: usize,
    pub current_msg_id: Option<i32>,
    pub awaiting_other_q: Option<String>,
    pub awaiting_other_o: Option<String>,
    pub multi_selection: Vec<Selection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAnswer {
    pub question_id: String,
    pub value: AnswerValue,
}

/// Строка ответа из завершённой анкеты для агрегатора.
#[derive(Debug, Clone, FromRow)]
pub struct CompletedAnswer {
    pub tg_id: i64,
    pub question_id: String,
    pub answer_text: Option<String>,
    pub option_ids_json: Option<String>,
}
