use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

use crate::callback::AnswerKind;
use crate::db::{self, Advance};
use crate::{AnswerValue, Choice, Progress, Question, QuestionKind, Selection, Survey, SurveyError, OTHER_PREFIX};

/// Итог запроса на старт анкеты.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyCompleted,
    Started(Progress),
    Resumed(Progress),
}

/// Куда перешёл пользователь после ответа.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Question(usize),
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answered {
    pub question_index: usize,
    /// Сообщение с отвеченным вопросом (для правки на месте).
    pub message_id: Option<i32>,
    pub value: AnswerValue,
    pub next: Next,
}

/// Результат одного входного события.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Ответ записан, курсор сдвинут.
    Answered(Answered),
    /// MULTI: выбор изменён, вопрос тот же.
    SelectionChanged {
        question_index: usize,
        message_id: Option<i32>,
        selection: Vec<Selection>,
    },
    /// Нажата опция «Другое»: ждём текст.
    AwaitingOther { question_index: usize },
    /// Колбэк от уже отвеченного вопроса.
    Stale,
    /// Событие не относится к текущему состоянию.
    Ignored,
}

/// Машина состояний анкеты. Всё состояние живёт в базе.
#[derive(Clone)]
pub struct SessionEngine {
    pool: SqlitePool,
    survey: Arc<Survey>,
}

impl SessionEngine {
    pub fn new(pool: SqlitePool, survey: Arc<Survey>) -> Self {
        SessionEngine { pool, survey }
    }

    pub fn survey(&self) -> &Survey {
        &self.survey
    }

    pub async fn start(&self, tg_id: i64) -> Result<StartOutcome, SurveyError> {
        if db::has_completed(&self.pool, tg_id).await? {
            return Ok(StartOutcome::AlreadyCompleted);
        }

        if let Some(progress) = db::load_progress(&self.pool, tg_id).await? {
            let progress = self.arm_free_text(tg_id, progress).await?;
            return Ok(StartOutcome::Resumed(progress));
        }

        db::start_response(&self.pool, tg_id).await?;
        let progress = db::load_progress(&self.pool, tg_id)
            .await?
            .ok_or_else(SurveyError::session_not_found)?;
        let progress = self.arm_free_text(tg_id, progress).await?;
        Ok(StartOutcome::Started(progress))
    }

    /// Текущий курсор и вопрос под ним.
    pub async fn current(&self, tg_id: i64) -> Result<Option<(Progress, &Question)>, SurveyError> {
        let Some(progress) = db::load_progress(&self.pool, tg_id).await? else {
            return Ok(None);
        };
        Ok(self
            .survey
            .question_at(progress.current_q_index)
            .map(|question| (progress, question)))
    }

    // Взводит ожидание текста, если вопрос под курсором его допускает.
    async fn arm_free_text(&self, tg_id: i64, mut progress: Progress) -> Result<Progress, SurveyError> {
        let Some(question) = self.survey.question_at(progress.current_q_index) else {
            return Ok(progress);
        };
        if !question.accepts_free_text() || progress.awaiting_other_q.as_deref() == Some(question.id.as_str()) {
            return Ok(progress);
        }

        db::save_progress(
            &self.pool,
            tg_id,
            progress.current_q_index,
            Some(&question.id),
            progress.awaiting_other_o.as_deref(),
            Some(&progress.multi_selection),
        )
        .await?;
        progress.awaiting_other_q = Some(question.id.clone());
        Ok(progress)
    }

    /// Нажатие кнопки ответа `ans:<question_id>:<kind>:<payload>`.
    pub async fn choose_option(
        &self,
        tg_id: i64,
        question_id: &str,
        kind: AnswerKind,
        payload: &str,
    ) -> Result<Transition, SurveyError> {
        let progress = db::load_progress(&self.pool, tg_id)
            .await?
            .ok_or_else(SurveyError::session_not_found)?;
        let Some(question) = self.survey.question_at(progress.current_q_index) else {
            return Ok(Transition::Ignored);
        };
        if question.id != question_id {
            debug!(
                "Stale callback from user {}: question {} while current is {}",
                tg_id, question_id, question.id
            );
            return Ok(Transition::Stale);
        }

        match (&question.kind, kind) {
            (QuestionKind::Single { options }, AnswerKind::Single) => {
                self.choose_single(tg_id, &progress, question, options, payload).await
            }
            (QuestionKind::Rating, AnswerKind::Rating) => {
                self.choose_rating(tg_id, &progress, question, payload).await
            }
            (QuestionKind::Multi { options, max }, AnswerKind::Multi) => {
                self.toggle_multi(tg_id, &progress, question, options, *max, payload).await
            }
            _ => Err(SurveyError::Invalid("Этот вариант не подходит к текущему вопросу.".to_string())),
        }
    }

    /// Текст, набранный в чат.
    pub async fn enter_free_text(&self, tg_id: i64, text: &str) -> Result<Transition, SurveyError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Transition::Ignored);
        }
        let Some(progress) = db::load_progress(&self.pool, tg_id).await? else {
            return Ok(Transition::Ignored);
        };
        let Some(question) = self.survey.question_at(progress.current_q_index) else {
            return Ok(Transition::Ignored);
        };
        if progress.awaiting_other_q.as_deref() != Some(question.id.as_str()) {
            return Ok(Transition::Ignored);
        }

        match &question.kind {
            QuestionKind::Text => {
                self.advance(tg_id, &progress, question, AnswerValue::Text(text.to_string()))
                    .await
            }
            QuestionKind::Single { .. } if question.has_other() => {
                let value = AnswerValue::Text(format!("{OTHER_PREFIX}{text}"));
                self.advance(tg_id, &progress, question, value).await
            }
            QuestionKind::Multi { max, .. } if question.has_other() => {
                if progress.multi_selection.len() >= *max {
                    return Err(over_max(*max));
                }
                let mut selection = progress.multi_selection.clone();
                selection.push(Selection::Other(text.to_string()));
                self.settle_multi(tg_id, &progress, question, *max, selection).await
            }
            _ => Ok(Transition::Ignored),
        }
    }

    async fn choose_single(
        &self,
        tg_id: i64,
        progress: &Progress,
        question: &Question,
        options: &[Choice],
        option_id: &str,
    ) -> Result<Transition, SurveyError> {
        let option = find_option(options, option_id)?;
        if option.other {
            return self.await_other(tg_id, progress, question, option).await;
        }
        self.advance(tg_id, progress, question, AnswerValue::Text(option.text.clone()))
            .await
    }

    async fn choose_rating(
        &self,
        tg_id: i64,
        progress: &Progress,
        question: &Question,
        payload: &str,
    ) -> Result<Transition, SurveyError> {
        let rating = payload
            .parse::<u8>()
            .ok()
            .filter(|r| (1..=10).contains(r))
            .ok_or_else(|| SurveyError::Invalid("Оценка должна быть от 1 до 10.".to_string()))?;
        self.advance(tg_id, progress, question, AnswerValue::Text(rating.to_string()))
            .await
    }

    async fn toggle_multi(
        &self,
        tg_id: i64,
        progress: &Progress,
        question: &Question,
        options: &[Choice],
        max: usize,
        option_id: &str,
    ) -> Result<Transition, SurveyError> {
        let option = find_option(options, option_id)?;
        if option.other {
            return self.await_other(tg_id, progress, question, option).await;
        }

        let mut selection = progress.multi_selection.clone();
        let picked = Selection::Picked(option.id.clone());
        match selection.iter().position(|s| *s == picked) {
            Some(pos) => {
                selection.remove(pos);
            }
            None if selection.len() >= max => return Err(over_max(max)),
            None => selection.push(picked),
        }
        self.settle_multi(tg_id, progress, question, max, selection).await
    }

    // Ровно max: фиксируем ответ, иначе сохраняем выбор и остаёмся на вопросе.
    async fn settle_multi(
        &self,
        tg_id: i64,
        progress: &Progress,
        question: &Question,
        max: usize,
        selection: Vec<Selection>,
    ) -> Result<Transition, SurveyError> {
        if selection.len() == max {
            let labels = selection.iter().map(|s| s.label(question)).collect();
            return self
                .advance(tg_id, progress, question, AnswerValue::Options(labels))
                .await;
        }

        db::save_progress(
            &self.pool,
            tg_id,
            progress.current_q_index,
            progress.awaiting_other_q.as_deref(),
            None,
            Some(&selection),
        )
        .await?;

        Ok(Transition::SelectionChanged {
            question_index: progress.current_q_index,
            message_id: progress.current_msg_id,
            selection,
        })
    }

    async fn await_other(
        &self,
        tg_id: i64,
        progress: &Progress,
        question: &Question,
        option: &Choice,
    ) -> Result<Transition, SurveyError> {
        db::save_progress(
            &self.pool,
            tg_id,
            progress.current_q_index,
            Some(&question.id),
            Some(&option.id),
            Some(&progress.multi_selection),
        )
        .await?;
        Ok(Transition::AwaitingOther { question_index: progress.current_q_index })
    }

    async fn advance(
        &self,
        tg_id: i64,
        progress: &Progress,
        question: &Question,
        value: AnswerValue,
    ) -> Result<Transition, SurveyError> {
        let next_index = progress.current_q_index + 1;
        let (advance, next) = match self.survey.question_at(next_index) {
            Some(next_question) => (
                Advance::Next {
                    index: next_index,
                    awaiting_q: next_question
                        .accepts_free_text()
                        .then_some(next_question.id.as_str()),
                },
                Next::Question(next_index),
            ),
            None => (Advance::Finish, Next::Finished),
        };

        db::record_answer(&self.pool, tg_id, progress.response_id, &question.id, &value, &advance).await?;

        Ok(Transition::Answered(Answered {
            question_index: progress.current_q_index,
            message_id: progress.current_msg_id,
            value,
            next,
        }))
    }
}

fn over_max(max: usize) -> SurveyError {
    SurveyError::Invalid(format!("Можно выбрать не более {}", max))
}

fn find_option<'a>(options: &'a [Choice], option_id: &str) -> Result<&'a Choice, SurveyError> {
    options
        .iter()
        .find(|o| o.id == option_id)
        .ok_or_else(|| SurveyError::NotFound("Опция не найдена.".to_string()))
}
