use sqlx::SqlitePool;
use std::sync::Arc;
use teloxide::utils::html;
use tracing::info;

use crate::stats::{self, StatsReport};
use crate::{db, Survey, SurveyError};

pub const USERS_PAGE_SIZE: usize = 15;

/// Страница списка пользователей и номер следующей, если она может быть.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsersPage {
    pub text: String,
    pub next_page: Option<usize>,
}

/// Админские операции. Каждая проверяет права вызывающего.
#[derive(Clone)]
pub struct AdminService {
    pool: SqlitePool,
    survey: Arc<Survey>,
}

fn parse_id(arg: Option<&str>, usage: &str) -> Result<i64, SurveyError> {
    let arg = arg.ok_or_else(|| SurveyError::Invalid(usage.to_string()))?;
    arg.trim()
        .parse()
        .map_err(|_| SurveyError::Invalid("ID должен быть числом.".to_string()))
}

impl AdminService {
    pub fn new(pool: SqlitePool, survey: Arc<Survey>) -> Self {
        AdminService { pool, survey }
    }

    pub async fn require_admin(&self, tg_id: i64) -> Result<(), SurveyError> {
        if db::is_admin(&self.pool, tg_id).await? {
            Ok(())
        } else {
            Err(SurveyError::Forbidden)
        }
    }

    pub async fn panel_text(&self, actor: i64) -> Result<String, SurveyError> {
        self.require_admin(actor).await?;
        let completed = db::count_completed(&self.pool).await;
        Ok(format!(
            "Админ-панель:\n— Завершённых анкет: {}\nВыберите действие ниже.",
            completed
        ))
    }

    /// `/adminadd <id>`.
    pub async fn add_admin(&self, actor: i64, arg: Option<&str>) -> Result<String, SurveyError> {
        let target = parse_id(arg, "Использование: /adminadd &lt;id&gt;")?;
        match db::add_admin(&self.pool, actor, target).await {
            Ok(()) => Ok(format!("Пользователь {} назначен администратором.", target)),
            Err(SurveyError::Forbidden) => {
                Ok("Доступ запрещён (только админ может добавлять админов).".to_string())
            }
            Err(e) => Err(e),
        }
    }

    /// `/user <id>`: ответы завершённой анкеты в порядке записи.
    pub async fn user_answers(&self, actor: i64, arg: Option<&str>) -> Result<String, SurveyError> {
        self.require_admin(actor).await?;
        let target = parse_id(arg, "Использование: /user &lt;id&gt;")?;

        let answers = db::get_user_answers(&self.pool, target).await;
        if answers.is_empty() {
            return Ok(format!("Нет завершённой анкеты у пользователя {}", target));
        }

        let mut text = format!("Ответы пользователя {}:\n", target);
        for answer in &answers {
            let question = self
                .survey
                .question(&answer.question_id)
                .map(|q| q.text.as_str())
                .unwrap_or(answer.question_id.as_str());
            text.push_str(&format!(
                "\n• {}\n   - {}\n",
                html::escape(question),
                html::escape(&answer.value.display())
            ));
        }
        Ok(text)
    }

    /// Страница `page` (с нуля) пользователей с завершённой анкетой.
    pub async fn users_page(&self, actor: i64, page: usize) -> Result<UsersPage, SurveyError> {
        self.require_admin(actor).await?;
        let offset = (page * USERS_PAGE_SIZE) as i64;
        let ids = db::list_completed_user_ids(&self.pool, USERS_PAGE_SIZE as i64, offset).await;

        if ids.is_empty() {
            return Ok(UsersPage { text: "Нет завершённых анкет.".to_string(), next_page: None });
        }

        let mut text = format!("Пользователи (страница {}):", page + 1);
        for id in &ids {
            text.push_str(&format!("\n• {}  (/user {})", id, id));
        }
        let next_page = (ids.len() == USERS_PAGE_SIZE).then_some(page + 1);
        Ok(UsersPage { text, next_page })
    }

    pub async fn stats(&self, actor: i64) -> Result<StatsReport, SurveyError> {
        self.require_admin(actor).await?;
        Ok(stats::load_report(&self.pool, &self.survey).await)
    }

    /// `/resetme`: стирает собственные ответы и прогресс.
    pub async fn reset_self(&self, actor: i64) -> Result<String, SurveyError> {
        self.require_admin(actor).await?;
        let removed = db::reset_user(&self.pool, actor).await?;
        info!("Admin {} reset own answers ({} responses removed)", actor, removed);
        Ok("Ваши ответы и прогресс очищены. Введите /start для нового прохождения.".to_string())
    }
}
