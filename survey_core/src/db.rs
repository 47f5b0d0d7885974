use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info};

use crate::{
    AnswerValue, CompletedAnswer, Progress, Response, Selection, StoredAnswer, SurveyError, User,
    UserInfo,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Куда двигать курсор после записи ответа.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance<'a> {
    /// Следующий вопрос; `awaiting_q` взводит ожидание свободного текста.
    Next { index: usize, awaiting_q: Option<&'a str> },
    /// Вопросы закончились: анкета завершается.
    Finish,
}

#[derive(Debug, FromRow)]
struct ProgressRow {
    response_id: i64,
    current_q_index: i64,
    current_msg_id: Option<i32>,
    awaiting_other_question_id: Option<String>,
    awaiting_other_option_id: Option<String>,
    multi_selection_json: Option<String>,
}

impl TryFrom<ProgressRow> for Progress {
    type Error = SurveyError;

    fn try_from(row: ProgressRow) -> Result<Self, Self::Error> {
        Ok(Progress {
            response_id: row.response_id,
            current_q_index: row.current_q_index.max(0) as usize,
            current_msg_id: row.current_msg_id,
            awaiting_other_q: row.awaiting_other_question_id,
            awaiting_other_o: row.awaiting_other_option_id,
            multi_selection: parse_selection(row.multi_selection_json.as_deref())?,
        })
    }
}

#[derive(Debug, FromRow)]
struct AnswerRow {
    question_id: String,
    answer_text: Option<String>,
    option_ids_json: Option<String>,
}

impl TryFrom<AnswerRow> for StoredAnswer {
    type Error = SurveyError;

    fn try_from(row: AnswerRow) -> Result<Self, Self::Error> {
        let value = match row.option_ids_json {
            Some(json) => AnswerValue::Options(serde_json::from_str(&json)?),
            None => AnswerValue::Text(row.answer_text.unwrap_or_default()),
        };
        Ok(StoredAnswer { question_id: row.question_id, value })
    }
}

fn parse_selection(json: Option<&str>) -> Result<Vec<Selection>, SurveyError> {
    match json {
        Some(json) => Ok(serde_json::from_str(json)?),
        None => Ok(Vec::new()),
    }
}

fn selection_json(multi: Option<&[Selection]>) -> Result<Option<String>, SurveyError> {
    match multi {
        Some(items) if !items.is_empty() => Ok(Some(serde_json::to_string(items)?)),
        _ => Ok(None),
    }
}

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, SurveyError> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT))
}

/// Открывает базу и применяет миграции. Ошибка здесь фатальна для старта.
pub async fn init_db(database_url: &str) -> Result<SqlitePool, SurveyError> {
    let options = connect_options(database_url)?;

    // Каталог под файл базы (обычно data/)
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SurveyError::Fatal(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
    }

    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    migrate(&pool).await?;
    info!("Database ready at {}", database_url);
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), SurveyError> {
    sqlx::migrate!("../migrations").run(pool).await?;
    Ok(())
}

// Users / admins

pub async fn ensure_user(pool: &SqlitePool, user: &UserInfo) -> Result<(), SurveyError> {
    sqlx::query(
        "INSERT INTO users (tg_id, first_name, last_name, username, created_at) VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(tg_id) DO UPDATE SET
            first_name = excluded.first_name,
            last_name = excluded.last_name,
            username = excluded.username",
    )
    .bind(user.tg_id)
    .bind(&user.first_name)
    .bind(&user.last_name)
    .bind(&user.username)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_user(pool: &SqlitePool, tg_id: i64) -> Result<Option<User>, SurveyError> {
    Ok(sqlx::query_as::<_, User>(
        "SELECT id, tg_id, first_name, last_name, username, is_admin, created_at FROM users WHERE tg_id = ?",
    )
    .bind(tg_id)
    .fetch_optional(pool)
    .await?)
}

pub async fn ensure_admin(pool: &SqlitePool, tg_id: i64) -> Result<(), SurveyError> {
    sqlx::query(
        "INSERT INTO users (tg_id, is_admin, created_at) VALUES (?, 1, ?)
         ON CONFLICT(tg_id) DO UPDATE SET is_admin = 1",
    )
    .bind(tg_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn is_admin(pool: &SqlitePool, tg_id: i64) -> Result<bool, SurveyError> {
    let flag: Option<i64> = sqlx::query_scalar("SELECT is_admin FROM users WHERE tg_id = ?")
        .bind(tg_id)
        .fetch_optional(pool)
        .await?;
    Ok(flag == Some(1))
}

pub async fn add_admin(pool: &SqlitePool, actor: i64, target: i64) -> Result<(), SurveyError> {
    if !is_admin(pool, actor).await? {
        return Err(SurveyError::Forbidden);
    }
    ensure_admin(pool, target).await?;
    info!("User {} granted admin rights to {}", actor, target);
    Ok(())
}

// Progress

pub async fn has_completed(pool: &SqlitePool, tg_id: i64) -> Result<bool, SurveyError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM responses r JOIN users u ON u.id = r.user_id
         WHERE u.tg_id = ? AND r.status = 'COMPLETED'",
    )
    .bind(tg_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

pub async fn in_draft(pool: &SqlitePool, tg_id: i64) -> Result<bool, SurveyError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM user_progress p JOIN users u ON u.id = p.user_id WHERE u.tg_id = ?",
    )
    .bind(tg_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Новый черновик и курсор на первом вопросе, одной транзакцией.
/// Брошенный черновик (если он почему-то остался) удаляется вместе с ответами.
pub async fn start_response(pool: &SqlitePool, tg_id: i64) -> Result<i64, SurveyError> {
    let mut tx = pool.begin().await?;

    let user_id: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE tg_id = ?")
        .bind(tg_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(user_id) = user_id else {
        return Err(SurveyError::NotFound(format!("Пользователь {} не найден.", tg_id)));
    };

    sqlx::query("DELETE FROM user_progress WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM answers WHERE response_id IN
            (SELECT id FROM responses WHERE user_id = ? AND status = 'DRAFT')",
    )
    .bind(user_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM responses WHERE user_id = ? AND status = 'DRAFT'")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    let now = Utc::now();
    let response_id = sqlx::query(
        "INSERT INTO responses (user_id, status, started_at) VALUES (?, 'DRAFT', ?)",
    )
    .bind(user_id)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    sqlx::query(
        "INSERT INTO user_progress (user_id, response_id, current_q_index, current_msg_id, updated_at)
         VALUES (?, ?, 0, NULL, ?)
         ON CONFLICT(user_id) DO UPDATE SET
            response_id = excluded.response_id,
            current_q_index = 0,
            current_msg_id = NULL,
            awaiting_other_question_id = NULL,
            awaiting_other_option_id = NULL,
            multi_selection_json = NULL,
            updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(response_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    info!("User {} started response {}", tg_id, response_id);
    Ok(response_id)
}

pub async fn load_progress(pool: &SqlitePool, tg_id: i64) -> Result<Option<Progress>, SurveyError> {
    let row = sqlx::query_as::<_, ProgressRow>(
        "SELECT p.response_id, p.current_q_index, p.current_msg_id,
                p.awaiting_other_question_id, p.awaiting_other_option_id, p.multi_selection_json
         FROM user_progress p JOIN users u ON u.id = p.user_id
         WHERE u.tg_id = ?",
    )
    .bind(tg_id)
    .fetch_optional(pool)
    .await?;

    row.map(Progress::try_from).transpose()
}

async fn save_progress_on(
    conn: &mut SqliteConnection,
    tg_id: i64,
    index: usize,
    awaiting_q: Option<&str>,
    awaiting_o: Option<&str>,
    multi: Option<&[Selection]>,
) -> Result<(), SurveyError> {
    let result = sqlx::query(
        "UPDATE user_progress SET
            current_q_index = ?,
            awaiting_other_question_id = ?,
            awaiting_other_option_id = ?,
            multi_selection_json = ?,
            updated_at = ?
         WHERE user_id = (SELECT id FROM users WHERE tg_id = ?)",
    )
    .bind(index as i64)
    .bind(awaiting_q)
    .bind(awaiting_o)
    .bind(selection_json(multi)?)
    .bind(Utc::now())
    .bind(tg_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(SurveyError::session_not_found());
    }
    Ok(())
}

/// Перезаписывает все четыре поля курсора; `multi = None` (или пустой список) очищает выбор.
pub async fn save_progress(
    pool: &SqlitePool,
    tg_id: i64,
    index: usize,
    awaiting_q: Option<&str>,
    awaiting_o: Option<&str>,
    multi: Option<&[Selection]>,
) -> Result<(), SurveyError> {
    let mut conn = pool.acquire().await?;
    save_progress_on(&mut conn, tg_id, index, awaiting_q, awaiting_o, multi).await
}

pub async fn set_current_message_id(
    pool: &SqlitePool,
    tg_id: i64,
    msg_id: Option<i32>,
) -> Result<(), SurveyError> {
    sqlx::query(
        "UPDATE user_progress SET current_msg_id = ?, updated_at = ?
         WHERE user_id = (SELECT id FROM users WHERE tg_id = ?)",
    )
    .bind(msg_id)
    .bind(Utc::now())
    .bind(tg_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_current_message_id(pool: &SqlitePool, tg_id: i64) -> Result<Option<i32>, SurveyError> {
    let msg_id: Option<Option<i32>> = sqlx::query_scalar(
        "SELECT p.current_msg_id FROM user_progress p JOIN users u ON u.id = p.user_id WHERE u.tg_id = ?",
    )
    .bind(tg_id)
    .fetch_optional(pool)
    .await?;
    Ok(msg_id.flatten())
}

pub async fn get_multi_selected(pool: &SqlitePool, tg_id: i64) -> Result<Vec<Selection>, SurveyError> {
    let json: Option<Option<String>> = sqlx::query_scalar(
        "SELECT p.multi_selection_json FROM user_progress p JOIN users u ON u.id = p.user_id WHERE u.tg_id = ?",
    )
    .bind(tg_id)
    .fetch_optional(pool)
    .await?;
    parse_selection(json.flatten().as_deref())
}

// Answers

async fn insert_answer_on(
    conn: &mut SqliteConnection,
    response_id: i64,
    question_id: &str,
    value: &AnswerValue,
) -> Result<(), SurveyError> {
    let (text, options) = match value {
        AnswerValue::Text(text) => (Some(text.clone()), None),
        AnswerValue::Options(labels) => (None, Some(serde_json::to_string(labels)?)),
    };

    sqlx::query(
        "INSERT INTO answers (response_id, question_id, answer_text, option_ids_json, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(response_id)
    .bind(question_id)
    .bind(text)
    .bind(options)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn insert_answer(
    pool: &SqlitePool,
    response_id: i64,
    question_id: &str,
    value: &AnswerValue,
) -> Result<(), SurveyError> {
    let mut conn = pool.acquire().await?;
    insert_answer_on(&mut conn, response_id, question_id, value).await
}

async fn finish_on(conn: &mut SqliteConnection, tg_id: i64) -> Result<(), SurveyError> {
    let result = sqlx::query(
        "UPDATE responses SET status = 'COMPLETED', completed_at = ?
         WHERE status = 'DRAFT' AND id = (
            SELECT p.response_id FROM user_progress p JOIN users u ON u.id = p.user_id WHERE u.tg_id = ?
         )",
    )
    .bind(Utc::now())
    .bind(tg_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(SurveyError::session_not_found());
    }

    sqlx::query("DELETE FROM user_progress WHERE user_id = (SELECT id FROM users WHERE tg_id = ?)")
        .bind(tg_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Завершает черновик и удаляет курсор одной транзакцией.
pub async fn finish_and_commit(pool: &SqlitePool, tg_id: i64) -> Result<(), SurveyError> {
    let mut tx = pool.begin().await?;
    finish_on(&mut tx, tg_id).await?;
    tx.commit().await?;
    info!("User {} completed the survey", tg_id);
    Ok(())
}

/// Ответ и сдвиг курсора (или завершение анкеты) одной транзакцией.
pub async fn record_answer(
    pool: &SqlitePool,
    tg_id: i64,
    response_id: i64,
    question_id: &str,
    value: &AnswerValue,
    advance: &Advance<'_>,
) -> Result<(), SurveyError> {
    let mut tx = pool.begin().await?;
    insert_answer_on(&mut tx, response_id, question_id, value).await?;
    match advance {
        Advance::Next { index, awaiting_q } => {
            save_progress_on(&mut tx, tg_id, *index, *awaiting_q, None, None).await?;
        }
        Advance::Finish => finish_on(&mut tx, tg_id).await?,
    }
    tx.commit().await?;

    if *advance == Advance::Finish {
        info!("User {} completed the survey", tg_id);
    }
    Ok(())
}

/// Удаляет все анкеты и курсор пользователя. Возвращает число удалённых анкет.
pub async fn reset_user(pool: &SqlitePool, tg_id: i64) -> Result<u64, SurveyError> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM user_progress WHERE user_id IN (SELECT id FROM users WHERE tg_id = ?)")
        .bind(tg_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM answers WHERE response_id IN
            (SELECT r.id FROM responses r JOIN users u ON u.id = r.user_id WHERE u.tg_id = ?)",
    )
    .bind(tg_id)
    .execute(&mut *tx)
    .await?;
    let deleted = sqlx::query("DELETE FROM responses WHERE user_id IN (SELECT id FROM users WHERE tg_id = ?)")
        .bind(tg_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;
    info!("User {} reset: {} responses removed", tg_id, deleted);
    Ok(deleted)
}

pub async fn get_responses(pool: &SqlitePool, tg_id: i64) -> Result<Vec<Response>, SurveyError> {
    Ok(sqlx::query_as::<_, Response>(
        "SELECT r.id, r.user_id, r.status, r.started_at, r.completed_at
         FROM responses r JOIN users u ON u.id = r.user_id
         WHERE u.tg_id = ? ORDER BY r.id",
    )
    .bind(tg_id)
    .fetch_all(pool)
    .await?)
}

// Read models for the aggregator

pub async fn count_completed(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM responses WHERE status = 'COMPLETED'")
        .fetch_one(pool)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to count completed responses: {}", e);
            0
        })
}

pub async fn list_completed_user_ids(pool: &SqlitePool, limit: i64, offset: i64) -> Vec<i64> {
    sqlx::query_scalar(
        "SELECT u.tg_id FROM responses r JOIN users u ON u.id = r.user_id
         WHERE r.status = 'COMPLETED'
         GROUP BY u.tg_id
         ORDER BY MAX(r.completed_at) DESC
         LIMIT ? OFFSET ?",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .unwrap_or_else(|e| {
        error!("Failed to list completed users: {}", e);
        Vec::new()
    })
}

pub async fn get_user_answers(pool: &SqlitePool, tg_id: i64) -> Vec<StoredAnswer> {
    let rows = sqlx::query_as::<_, AnswerRow>(
        "SELECT a.question_id, a.answer_text, a.option_ids_json
         FROM answers a
         JOIN responses r ON r.id = a.response_id
         JOIN users u ON u.id = r.user_id
         WHERE u.tg_id = ? AND r.status = 'COMPLETED'
         ORDER BY a.id",
    )
    .bind(tg_id)
    .fetch_all(pool)
    .await
    .unwrap_or_else(|e| {
        error!("Failed to load answers of user {}: {}", tg_id, e);
        Vec::new()
    });

    rows.into_iter()
        .filter_map(|row| match StoredAnswer::try_from(row) {
            Ok(answer) => Some(answer),
            Err(e) => {
                error!("Skipping unreadable answer of user {}: {}", tg_id, e);
                None
            }
        })
        .collect()
}

pub async fn get_all_completed_answers(pool: &SqlitePool) -> Vec<CompletedAnswer> {
    sqlx::query_as::<_, CompletedAnswer>(
        "SELECT u.tg_id, a.question_id, a.answer_text, a.option_ids_json
         FROM answers a
         JOIN responses r ON r.id = a.response_id
         JOIN users u ON u.id = r.user_id
         WHERE r.status = 'COMPLETED'
         ORDER BY a.id",
    )
    .fetch_all(pool)
    .await
    .unwrap_or_else(|e| {
        error!("Failed to load completed answers: {}", e);
        Vec::new()
    })
}

/// Пул на одну in-memory базу с применёнными миграциями.
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();
    migrate(&pool).await.unwrap();
    pool
}
