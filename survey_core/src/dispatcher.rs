use sqlx::SqlitePool;
use teloxide::utils::html;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use crate::admin::AdminService;
use crate::callback::CallbackData;
use crate::engine::{Answered, Next, SessionEngine, StartOutcome, Transition};
use crate::gateway::{ChatCommand, ChatGateway, InboundKind, InboundUpdate, IncomingCallback, IncomingMessage, Keyboard};
use crate::render;
use crate::stats::{split_by_size, StatsReport, MAX_CHUNK_CHARS};
use crate::{db, Selection, Survey, SurveyError, UserInfo};

/// Сколько последних id апдейтов помним для отсева повторов.
pub const DEDUP_CAPACITY: usize = 1000;
pub const EXPORT_FILE_NAME: &str = "survey_stats.csv";

const ALREADY_COMPLETED: &str = "Вы уже проходили анкетирование. Спасибо!";
const SURVEY_CLOSED: &str = "Опрос завершён. Спасибо!";
const USE_BUTTONS: &str = "Пожалуйста, используйте кнопки ниже. Если они исчезли — введите /restart.";
const NO_SUCH_PAGE: &str = "Нет такой страницы.";

static LISTENING: AtomicBool = AtomicBool::new(false);

/// Право на единственный цикл приёма апдейтов в процессе. Снимается при drop.
#[derive(Debug)]
pub struct ListenerGuard {
    _private: (),
}

impl ListenerGuard {
    pub fn acquire() -> Option<Self> {
        LISTENING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ListenerGuard { _private: () })
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        LISTENING.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct RecentUpdates {
    order: VecDeque<u32>,
    ids: HashSet<u32>,
}

impl RecentUpdates {
    /// `false`, если id уже встречался.
    fn insert(&mut self, id: u32) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > DEDUP_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Разбирает входящие апдейты и отвечает через `ChatGateway`.
pub struct SurveyDispatcher {
    pool: SqlitePool,
    survey: Arc<Survey>,
    engine: SessionEngine,
    admin: AdminService,
    gateway: Arc<dyn ChatGateway>,
    recent: Mutex<RecentUpdates>,
}

impl SurveyDispatcher {
    pub fn new(pool: SqlitePool, survey: Arc<Survey>, gateway: Arc<dyn ChatGateway>) -> Self {
        SurveyDispatcher {
            engine: SessionEngine::new(pool.clone(), survey.clone()),
            admin: AdminService::new(pool.clone(), survey.clone()),
            pool,
            survey,
            gateway,
            recent: Mutex::new(RecentUpdates::default()),
        }
    }

    fn first_seen(&self, update_id: u32) -> bool {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(update_id)
    }

    /// Обрабатывает апдейт целиком. Ошибки логируются или уходят пользователю текстом.
    pub async fn handle_update(&self, update: InboundUpdate) {
        if !self.first_seen(update.id) {
            debug!("Dropping duplicate update {}", update.id);
            return;
        }

        match update.kind {
            InboundKind::Message(msg) => {
                self.touch_user(&msg.from).await;
                if let Err(e) = self.on_message(&msg).await {
                    self.report(msg.chat_id, e).await;
                }
            }
            InboundKind::Callback(cb) => {
                self.touch_user(&cb.from).await;
                let toast = match self.on_callback(&cb).await {
                    Ok(toast) => toast,
                    Err(e) => e.user_message().or_else(|| {
                        error!("Failed to handle callback from {}: {}", cb.from.tg_id, e);
                        None
                    }),
                };
                // ack всегда, чтобы клиент не слал нажатие повторно
                if let Err(e) = self.gateway.answer_callback(&cb.id, toast.as_deref()).await {
                    error!("Failed to answer callback {}: {}", cb.id, e);
                }
            }
        }
    }

    async fn touch_user(&self, user: &UserInfo) {
        if let Err(e) = db::ensure_user(&self.pool, user).await {
            error!("Failed to upsert user {}: {}", user.tg_id, e);
        }
    }

    async fn report(&self, chat_id: i64, err: SurveyError) {
        match err.user_message() {
            Some(text) => {
                if let Err(e) = self.gateway.send_text(chat_id, &text).await {
                    error!("Failed to send error message to {}: {}", chat_id, e);
                }
            }
            None => error!("Failed to handle message in chat {}: {}", chat_id, err),
        }
    }

    async fn on_message(&self, msg: &IncomingMessage) -> Result<(), SurveyError> {
        let (chat_id, tg_id) = (msg.chat_id, msg.from.tg_id);
        if let Some(command) = msg.command.clone() {
            return self.on_command(chat_id, tg_id, command).await;
        }
        let Some(text) = msg.text.as_deref() else {
            return Ok(());
        };

        match self.engine.enter_free_text(tg_id, text).await? {
            Transition::Ignored => self.fallback(chat_id, tg_id).await,
            transition => self.apply(chat_id, tg_id, transition, None).await,
        }
    }

    async fn on_command(&self, chat_id: i64, tg_id: i64, command: ChatCommand) -> Result<(), SurveyError> {
        match command {
            ChatCommand::Start => {
                if db::has_completed(&self.pool, tg_id).await? {
                    self.send(chat_id, ALREADY_COMPLETED).await
                } else {
                    self.send_welcome(chat_id).await
                }
            }
            ChatCommand::Restart => {
                if db::has_completed(&self.pool, tg_id).await? {
                    self.send(chat_id, ALREADY_COMPLETED).await
                } else if db::in_draft(&self.pool, tg_id).await? {
                    self.show_current(chat_id, tg_id).await
                } else {
                    self.send_welcome(chat_id).await
                }
            }
            ChatCommand::ResetMe => {
                let reply = self.admin.reset_self(tg_id).await?;
                self.send(chat_id, &reply).await
            }
            ChatCommand::Admin => {
                let text = self.admin.panel_text(tg_id).await?;
                self.gateway
                    .send_text_with_keyboard(chat_id, &text, &render::admin_menu())
                    .await?;
                Ok(())
            }
            ChatCommand::AdminAdd(arg) => {
                let reply = self.admin.add_admin(tg_id, arg.as_deref()).await?;
                self.send(chat_id, &reply).await
            }
            ChatCommand::User(arg) => {
                let text = self.admin.user_answers(tg_id, arg.as_deref()).await?;
                self.send_chunks(chat_id, &text, None).await
            }
        }
    }

    /// Возвращает текст всплывающего уведомления для ответа на колбэк.
    async fn on_callback(&self, cb: &IncomingCallback) -> Result<Option<String>, SurveyError> {
        let Some(raw) = cb.data.as_deref() else {
            return Ok(None);
        };
        let data = match raw.parse::<CallbackData>() {
            Ok(data) => data,
            Err(never) => match never {},
        };
        let (chat_id, tg_id) = (cb.chat_id, cb.from.tg_id);

        match data {
            CallbackData::Start => {
                self.start_survey(chat_id, tg_id).await?;
            }
            CallbackData::Answer { question_id, kind, payload } => {
                let transition = self.engine.choose_option(tg_id, &question_id, kind, &payload).await?;
                self.apply(chat_id, tg_id, transition, cb.message_id).await?;
            }
            CallbackData::AdminMenu => {
                let text = self.admin.panel_text(tg_id).await?;
                self.gateway
                    .send_text_with_keyboard(chat_id, &text, &render::admin_menu())
                    .await?;
            }
            CallbackData::AdminStats => {
                let report = self.admin.stats(tg_id).await?;
                self.send_stats_page(chat_id, &report, 0).await?;
                self.send_stats_page(chat_id, &report, 1).await?;
            }
            CallbackData::AdminStatsNext(page) => {
                let report = self.admin.stats(tg_id).await?;
                if page == 0 || page >= report.total_pages() {
                    return Ok(Some(NO_SUCH_PAGE.to_string()));
                }
                self.send_stats_page(chat_id, &report, page).await?;
            }
            CallbackData::AdminUsers => self.send_users_page(chat_id, tg_id, 0).await?,
            CallbackData::AdminUsersPage(page) => self.send_users_page(chat_id, tg_id, page).await?,
            CallbackData::AdminExport => {
                let report = self.admin.stats(tg_id).await?;
                self.gateway
                    .send_document(chat_id, EXPORT_FILE_NAME, report.to_csv())
                    .await?;
                info!("Admin {} exported statistics", tg_id);
            }
            CallbackData::Unknown(raw) => {
                debug!("Ignoring callback data {:?} from {}", raw, tg_id);
            }
        }
        Ok(None)
    }

    async fn start_survey(&self, chat_id: i64, tg_id: i64) -> Result<(), SurveyError> {
        match self.engine.start(tg_id).await? {
            StartOutcome::AlreadyCompleted => self.send(chat_id, ALREADY_COMPLETED).await,
            StartOutcome::Started(progress) => {
                self.send_question(chat_id, tg_id, progress.current_q_index, &progress.multi_selection)
                    .await
            }
            StartOutcome::Resumed(_) => self.show_current(chat_id, tg_id).await,
        }
    }

    async fn apply(
        &self,
        chat_id: i64,
        tg_id: i64,
        transition: Transition,
        origin: Option<i32>,
    ) -> Result<(), SurveyError> {
        match transition {
            Transition::Answered(answered) => self.after_answer(chat_id, tg_id, answered, origin).await,
            Transition::SelectionChanged { question_index, message_id, selection } => {
                let Some(question) = self.survey.question_at(question_index) else {
                    return Ok(());
                };
                let text = render::question_text(question, &selection);
                let keyboard = render::question_keyboard(question, &selection);
                match message_id.or(origin) {
                    Some(message_id) => self.edit_or_send(chat_id, tg_id, message_id, &text, &keyboard).await,
                    None => self.send_question_message(chat_id, tg_id, &text, &keyboard).await,
                }
            }
            Transition::AwaitingOther { .. } => self.send(chat_id, render::OTHER_PROMPT).await,
            Transition::Stale | Transition::Ignored => Ok(()),
        }
    }

    // Правит отвеченный вопрос в сводку и шлёт следующий (или финальный текст).
    async fn after_answer(
        &self,
        chat_id: i64,
        tg_id: i64,
        answered: Answered,
        origin: Option<i32>,
    ) -> Result<(), SurveyError> {
        let question = self.survey.question_at(answered.question_index);
        if let (Some(question), Some(message_id)) = (question, answered.message_id.or(origin)) {
            let summary = render::answer_summary(question, &answered.value);
            if let Err(e) = self.gateway.edit_text(chat_id, message_id, &summary).await {
                warn!("Failed to edit answered message {} in chat {}: {}", message_id, chat_id, e);
            }
        }

        match answered.next {
            Next::Question(index) => self.send_question(chat_id, tg_id, index, &[]).await,
            Next::Finished => self.send(chat_id, &html::escape(&self.survey.finish)).await,
        }
    }

    async fn send_question(
        &self,
        chat_id: i64,
        tg_id: i64,
        index: usize,
        selection: &[Selection],
    ) -> Result<(), SurveyError> {
        let Some(question) = self.survey.question_at(index) else {
            return Ok(());
        };
        let text = render::question_text(question, selection);
        let keyboard = render::question_keyboard(question, selection);
        self.send_question_message(chat_id, tg_id, &text, &keyboard).await
    }

    async fn send_question_message(
        &self,
        chat_id: i64,
        tg_id: i64,
        text: &str,
        keyboard: &Keyboard,
    ) -> Result<(), SurveyError> {
        let message_id = self.gateway.send_text_with_keyboard(chat_id, text, keyboard).await?;
        db::set_current_message_id(&self.pool, tg_id, Some(message_id)).await
    }

    async fn edit_or_send(
        &self,
        chat_id: i64,
        tg_id: i64,
        message_id: i32,
        text: &str,
        keyboard: &Keyboard,
    ) -> Result<(), SurveyError> {
        match self
            .gateway
            .edit_text_with_keyboard(chat_id, message_id, text, keyboard)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Failed to edit message {} in chat {}, sending anew: {}", message_id, chat_id, e);
                self.send_question_message(chat_id, tg_id, text, keyboard).await
            }
        }
    }

    /// Заново показывает текущий вопрос, по возможности на месте старого сообщения.
    async fn show_current(&self, chat_id: i64, tg_id: i64) -> Result<(), SurveyError> {
        let Some((progress, question)) = self.engine.current(tg_id).await? else {
            return self.send_welcome(chat_id).await;
        };
        let text = render::question_text(question, &progress.multi_selection);
        let keyboard = render::question_keyboard(question, &progress.multi_selection);
        match progress.current_msg_id {
            Some(message_id) => self.edit_or_send(chat_id, tg_id, message_id, &text, &keyboard).await,
            None => self.send_question_message(chat_id, tg_id, &text, &keyboard).await,
        }
    }

    async fn fallback(&self, chat_id: i64, tg_id: i64) -> Result<(), SurveyError> {
        if db::has_completed(&self.pool, tg_id).await? {
            self.send(chat_id, SURVEY_CLOSED).await
        } else if db::in_draft(&self.pool, tg_id).await? {
            self.show_current(chat_id, tg_id).await
        } else {
            self.send(chat_id, USE_BUTTONS).await
        }
    }

    async fn send_welcome(&self, chat_id: i64) -> Result<(), SurveyError> {
        self.gateway
            .send_text_with_keyboard(
                chat_id,
                &render::welcome_text(&self.survey),
                &render::start_keyboard(&self.survey),
            )
            .await?;
        Ok(())
    }

    async fn send_stats_page(&self, chat_id: i64, report: &StatsReport, page: usize) -> Result<(), SurveyError> {
        let text = report.render_page(page);
        let nav = (page > 0).then(|| {
            let next = (page + 1 < report.total_pages()).then_some(page + 1);
            render::stats_nav(next)
        });
        self.send_chunks(chat_id, &text, nav.as_ref()).await
    }

    async fn send_users_page(&self, chat_id: i64, tg_id: i64, page: usize) -> Result<(), SurveyError> {
        let users = self.admin.users_page(tg_id, page).await?;
        self.gateway
            .send_text_with_keyboard(chat_id, &users.text, &render::users_nav(users.next_page))
            .await?;
        Ok(())
    }

    async fn send(&self, chat_id: i64, text: &str) -> Result<(), SurveyError> {
        self.gateway.send_text(chat_id, text).await?;
        Ok(())
    }

    // Длинный текст уходит несколькими сообщениями; клавиатура только у последнего.
    async fn send_chunks(&self, chat_id: i64, text: &str, keyboard: Option<&Keyboard>) -> Result<(), SurveyError> {
        let chunks = split_by_size(text, MAX_CHUNK_CHARS);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            match keyboard {
                Some(keyboard) if i == last => {
                    self.gateway.send_text_with_keyboard(chat_id, chunk, keyboard).await?;
                }
                _ => {
                    self.gateway.send_text(chat_id, chunk).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;
    use crate::questionnaire::{MULTI_OTHER_SURVEY, TEST_SURVEY};
    use crate::{AnswerValue, ResponseStatus};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicI32;

    const USER: i64 = 100;
    const ADMIN: i64 = 1;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Sent {
        Text { chat_id: i64, message_id: i32, text: String, keyboard: Option<Keyboard> },
        Edit { chat_id: i64, message_id: i32, text: String, keyboard: Option<Keyboard> },
        Ack { callback_id: String, text: Option<String> },
        Document { chat_id: i64, file_name: String, bytes: Vec<u8> },
    }

    #[derive(Default)]
    struct RecordingGateway {
        sent: Mutex<Vec<Sent>>,
        counter: AtomicI32,
    }

    impl RecordingGateway {
        fn push(&self, sent: Sent) {
            self.sent.lock().unwrap().push(sent);
        }

        fn take(&self) -> Vec<Sent> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        fn next_message_id(&self) -> i32 {
            1000 + self.counter.fetch_add(1, Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatGateway for RecordingGateway {
        async fn send_text(&self, chat_id: i64, text: &str) -> Result<i32, GatewayError> {
            let message_id = self.next_message_id();
            self.push(Sent::Text { chat_id, message_id, text: text.to_string(), keyboard: None });
            Ok(message_id)
        }

        async fn send_text_with_keyboard(
            &self,
            chat_id: i64,
            text: &str,
            keyboard: &Keyboard,
        ) -> Result<i32, GatewayError> {
            let message_id = self.next_message_id();
            self.push(Sent::Text {
                chat_id,
                message_id,
                text: text.to_string(),
                keyboard: Some(keyboard.clone()),
            });
            Ok(message_id)
        }

        async fn edit_text(&self, chat_id: i64, message_id: i32, text: &str) -> Result<(), GatewayError> {
            self.push(Sent::Edit { chat_id, message_id, text: text.to_string(), keyboard: None });
            Ok(())
        }

        async fn edit_text_with_keyboard(
            &self,
            chat_id: i64,
            message_id: i32,
            text: &str,
            keyboard: &Keyboard,
        ) -> Result<(), GatewayError> {
            self.push(Sent::Edit {
                chat_id,
                message_id,
                text: text.to_string(),
                keyboard: Some(keyboard.clone()),
            });
            Ok(())
        }

        async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), GatewayError> {
            self.push(Sent::Ack { callback_id: callback_id.to_string(), text: text.map(str::to_string) });
            Ok(())
        }

        async fn send_document(&self, chat_id: i64, file_name: &str, bytes: Vec<u8>) -> Result<(), GatewayError> {
            self.push(Sent::Document { chat_id, file_name: file_name.to_string(), bytes });
            Ok(())
        }
    }

    struct Harness {
        pool: SqlitePool,
        gateway: Arc<RecordingGateway>,
        dispatcher: SurveyDispatcher,
        update_id: u32,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_survey(TEST_SURVEY).await
        }

        async fn with_survey(json: &str) -> Self {
            let pool = db::test_pool().await;
            db::ensure_admin(&pool, ADMIN).await.unwrap();
            let survey = Arc::new(Survey::from_json(json).unwrap());
            let gateway = Arc::new(RecordingGateway::default());
            let dispatcher = SurveyDispatcher::new(pool.clone(), survey, gateway.clone());
            Harness { pool, gateway, dispatcher, update_id: 0 }
        }

        fn next_id(&mut self) -> u32 {
            self.update_id += 1;
            self.update_id
        }

        async fn message(&mut self, tg_id: i64, text: &str, command: Option<ChatCommand>) {
            let update = InboundUpdate {
                id: self.next_id(),
                kind: InboundKind::Message(IncomingMessage {
                    chat_id: tg_id,
                    from: UserInfo { tg_id, ..Default::default() },
                    text: Some(text.to_string()),
                    command,
                }),
            };
            self.dispatcher.handle_update(update).await;
        }

        async fn text(&mut self, tg_id: i64, text: &str) {
            self.message(tg_id, text, None).await;
        }

        async fn command(&mut self, tg_id: i64, command: ChatCommand) {
            let text = match &command {
                ChatCommand::Start => "/start",
                ChatCommand::Restart => "/restart",
                ChatCommand::ResetMe => "/resetme",
                ChatCommand::Admin => "/admin",
                ChatCommand::AdminAdd(_) => "/adminadd",
                ChatCommand::User(_) => "/user",
            };
            self.message(tg_id, text, Some(command)).await;
        }

        async fn tap_update(&mut self, tg_id: i64, data: &str) -> InboundUpdate {
            let message_id = db::get_current_message_id(&self.pool, tg_id).await.unwrap();
            let id = self.next_id();
            InboundUpdate {
                id,
                kind: InboundKind::Callback(IncomingCallback {
                    id: format!("cb{}", id),
                    chat_id: tg_id,
                    message_id,
                    from: UserInfo { tg_id, ..Default::default() },
                    data: Some(data.to_string()),
                }),
            }
        }

        async fn tap(&mut self, tg_id: i64, data: &str) {
            let update = self.tap_update(tg_id, data).await;
            self.dispatcher.handle_update(update).await;
        }

        async fn complete_survey(&mut self, tg_id: i64) {
            self.command(tg_id, ChatCommand::Start).await;
            self.tap(tg_id, "start").await;
            self.tap(tg_id, "ans:Q1:s:a").await;
            self.tap(tg_id, "ans:Q2:m:x").await;
            self.tap(tg_id, "ans:Q2:m:z").await;
            self.tap(tg_id, "ans:Q3:r:7").await;
            self.text(tg_id, "free response").await;
        }

        async fn draft_answers(&self) -> Vec<(String, Option<String>, Option<String>)> {
            sqlx::query_as("SELECT question_id, answer_text, option_ids_json FROM answers ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .unwrap()
        }

        async fn current_index(&self, tg_id: i64) -> usize {
            db::load_progress(&self.pool, tg_id).await.unwrap().unwrap().current_q_index
        }
    }

    fn texts(sent: &[Sent]) -> Vec<&str> {
        sent.iter()
            .filter_map(|s| match s {
                Sent::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn acks(sent: &[Sent]) -> Vec<Option<&str>> {
        sent.iter()
            .filter_map(|s| match s {
                Sent::Ack { text, .. } => Some(text.as_deref()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn happy_path_completes_the_survey() {
        let mut h = Harness::new().await;

        h.command(USER, ChatCommand::Start).await;
        let sent = h.gateway.take();
        match &sent[..] {
            [Sent::Text { keyboard: Some(kb), .. }] => assert_eq!(kb.rows[0][0].data, "start"),
            other => panic!("unexpected {:?}", other),
        }

        h.tap(USER, "start").await;
        let q1_message = db::get_current_message_id(&h.pool, USER).await.unwrap().unwrap();
        h.gateway.take();

        h.tap(USER, "ans:Q1:s:a").await;
        let sent = h.gateway.take();
        assert!(sent.contains(&Sent::Edit {
            chat_id: USER,
            message_id: q1_message,
            text: "Первый вопрос\n\n<b>Ваш ответ:</b> <b>A-label</b>".to_string(),
            keyboard: None,
        }));
        assert!(texts(&sent)[0].starts_with("Второй вопрос"));

        h.tap(USER, "ans:Q2:m:x").await;
        h.tap(USER, "ans:Q2:m:z").await;
        h.tap(USER, "ans:Q3:r:7").await;
        h.text(USER, "free response").await;

        let sent = h.gateway.take();
        assert_eq!(texts(&sent).last(), Some(&"Спасибо!"));

        let values: Vec<AnswerValue> = db::get_user_answers(&h.pool, USER)
            .await
            .into_iter()
            .map(|a| a.value)
            .collect();
        assert_eq!(
            values,
            vec![
                AnswerValue::Text("A-label".into()),
                AnswerValue::Options(vec!["X".into(), "Z".into()]),
                AnswerValue::Text("7".into()),
                AnswerValue::Text("free response".into()),
            ]
        );
        let responses = db::get_responses(&h.pool, USER).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, ResponseStatus::Completed);
        assert!(db::load_progress(&h.pool, USER).await.unwrap().is_none());

        h.command(USER, ChatCommand::Start).await;
        h.text(USER, "hello").await;
        let sent = h.gateway.take();
        assert_eq!(texts(&sent), vec![ALREADY_COMPLETED, SURVEY_CLOSED]);
    }

    #[tokio::test]
    async fn stale_tap_is_ignored() {
        let mut h = Harness::new().await;
        h.command(USER, ChatCommand::Start).await;
        h.tap(USER, "start").await;
        h.tap(USER, "ans:Q1:s:a").await;
        h.gateway.take();

        h.tap(USER, "ans:Q1:s:b").await;
        let sent = h.gateway.take();
        assert_eq!(acks(&sent), vec![None]);
        assert_eq!(sent.len(), 1);
        assert_eq!(h.current_index(USER).await, 1);
        assert_eq!(h.draft_answers().await.len(), 1);
    }

    #[tokio::test]
    async fn multi_over_max_keeps_selection() {
        let mut h = Harness::new().await;
        h.command(USER, ChatCommand::Start).await;
        h.tap(USER, "start").await;
        h.tap(USER, "ans:Q1:s:a").await;
        let seeded = vec![Selection::Picked("x".into()), Selection::Picked("y".into())];
        db::save_progress(&h.pool, USER, 1, None, None, Some(&seeded)).await.unwrap();
        h.gateway.take();

        h.tap(USER, "ans:Q2:m:z").await;
        let sent = h.gateway.take();
        assert_eq!(acks(&sent), vec![Some("Можно выбрать не более 2")]);
        assert_eq!(db::get_multi_selected(&h.pool, USER).await.unwrap(), seeded);

        h.tap(USER, "ans:Q2:m:y").await;
        let sent = h.gateway.take();
        let edited = sent.iter().any(|s| matches!(s, Sent::Edit { text, .. } if text.ends_with("Выбрано: 1 / 2\n• X")));
        assert!(edited, "{:?}", sent);

        h.tap(USER, "ans:Q2:m:z").await;
        let answers = h.draft_answers().await;
        assert_eq!(answers[1], ("Q2".to_string(), None, Some(r#"["X","Z"]"#.to_string())));
        assert_eq!(h.current_index(USER).await, 2);
    }

    #[tokio::test]
    async fn single_other_takes_free_text() {
        let mut h = Harness::new().await;
        h.command(USER, ChatCommand::Start).await;
        h.tap(USER, "start").await;
        h.gateway.take();

        h.tap(USER, "ans:Q1:s:other").await;
        assert_eq!(texts(&h.gateway.take()), vec![render::OTHER_PROMPT]);

        h.text(USER, "custom").await;
        let answers = h.draft_answers().await;
        assert_eq!(answers[0].1.as_deref(), Some("Другое: custom"));
        assert_eq!(h.current_index(USER).await, 1);
    }

    #[tokio::test]
    async fn duplicate_update_is_processed_once() {
        let mut h = Harness::new().await;
        h.command(USER, ChatCommand::Start).await;
        h.tap(USER, "start").await;
        h.tap(USER, "ans:Q1:s:a").await;
        h.gateway.take();

        let update = h.tap_update(USER, "ans:Q2:m:x").await;
        h.dispatcher.handle_update(update.clone()).await;
        h.dispatcher.handle_update(update).await;

        assert_eq!(
            db::get_multi_selected(&h.pool, USER).await.unwrap(),
            vec![Selection::Picked("x".into())]
        );
        assert_eq!(acks(&h.gateway.take()).len(), 1);
    }

    #[tokio::test]
    async fn admin_stats_pages() {
        let mut h = Harness::new().await;
        h.complete_survey(ADMIN).await;
        h.gateway.take();

        h.tap(ADMIN, "admin:stats").await;
        let sent = h.gateway.take();
        let pages = texts(&sent);
        assert_eq!(pages[0], "Завершили опрос: 1");
        assert!(pages[1].starts_with("• Первый вопрос\n\n"));

        h.tap(ADMIN, "admin:stats:next:2").await;
        let sent = h.gateway.take();
        let page = texts(&sent)[0];
        assert!(page.contains("X — 1 голосов (100%)"));
        assert!(page.contains("Y — 0 голосов (0%)"));
        assert!(page.contains("Z — 1 голосов (100%)"));

        h.tap(ADMIN, "admin:stats:next:9").await;
        assert_eq!(acks(&h.gateway.take()), vec![Some(NO_SUCH_PAGE)]);
    }

    #[tokio::test]
    async fn admin_surface_is_gated() {
        let mut h = Harness::new().await;

        h.tap(USER, "admin:stats").await;
        h.command(USER, ChatCommand::Admin).await;
        let sent = h.gateway.take();
        assert_eq!(acks(&sent), vec![Some("Доступ запрещён.")]);
        assert_eq!(texts(&sent), vec!["Доступ запрещён."]);

        h.command(ADMIN, ChatCommand::Admin).await;
        let sent = h.gateway.take();
        assert_eq!(
            texts(&sent),
            vec!["Админ-панель:\n— Завершённых анкет: 0\nВыберите действие ниже."]
        );
    }

    #[tokio::test]
    async fn admin_export_sends_csv() {
        let mut h = Harness::new().await;
        h.complete_survey(USER).await;
        h.gateway.take();

        h.tap(ADMIN, "admin:export").await;
        let sent = h.gateway.take();
        match &sent[0] {
            Sent::Document { file_name, bytes, .. } => {
                assert_eq!(file_name, EXPORT_FILE_NAME);
                assert!(bytes.starts_with(&[0xEF, 0xBB, 0xBF]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn restart_rerenders_current_question_in_place() {
        let mut h = Harness::new().await;
        h.text(USER, "hi").await;
        assert_eq!(texts(&h.gateway.take()), vec![USE_BUTTONS]);

        h.command(USER, ChatCommand::Start).await;
        h.tap(USER, "start").await;
        let q1_message = db::get_current_message_id(&h.pool, USER).await.unwrap().unwrap();
        h.gateway.take();

        h.command(USER, ChatCommand::Restart).await;
        let sent = h.gateway.take();
        match &sent[..] {
            [Sent::Edit { message_id, text, keyboard: Some(_), .. }] => {
                assert_eq!(*message_id, q1_message);
                assert!(text.starts_with("Первый вопрос"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn multi_free_text_appends_then_finalizes() {
        let mut h = Harness::with_survey(MULTI_OTHER_SURVEY).await;
        h.command(USER, ChatCommand::Start).await;
        h.tap(USER, "start").await;
        let question_message = db::get_current_message_id(&h.pool, USER).await.unwrap().unwrap();
        h.gateway.take();

        h.text(USER, "своё").await;
        let sent = h.gateway.take();
        let edited = sent.iter().any(|s| {
            matches!(s, Sent::Edit { message_id, text, .. }
                if *message_id == question_message && text.ends_with("Выбрано: 1 / 2\n• Другое: своё"))
        });
        assert!(edited, "{:?}", sent);
        assert_eq!(h.current_index(USER).await, 0);
        assert!(h.draft_answers().await.is_empty());

        h.tap(USER, "ans:M:m:x").await;
        let answers = h.draft_answers().await;
        assert_eq!(answers[0], ("M".to_string(), None, Some(r#"["Другое: своё","X"]"#.to_string())));
        assert_eq!(h.current_index(USER).await, 1);
    }

    #[tokio::test]
    async fn multi_other_text_at_max_is_stored_with_prefix() {
        let mut h = Harness::with_survey(MULTI_OTHER_SURVEY).await;
        h.command(USER, ChatCommand::Start).await;
        h.tap(USER, "start").await;
        h.tap(USER, "ans:M:m:x").await;
        h.tap(USER, "ans:M:m:other").await;
        assert_eq!(texts(&h.gateway.take()).last(), Some(&render::OTHER_PROMPT));

        h.text(USER, "своё").await;
        let sent = h.gateway.take();
        assert!(texts(&sent).last().is_some_and(|t| t.starts_with("Комментарий")));
        let answers = h.draft_answers().await;
        assert_eq!(answers, vec![("M".to_string(), None, Some(r#"["X","Другое: своё"]"#.to_string()))]);
        assert_eq!(h.current_index(USER).await, 1);
    }

    #[tokio::test]
    async fn multi_other_text_over_max_is_rejected() {
        let mut h = Harness::with_survey(MULTI_OTHER_SURVEY).await;
        h.command(USER, ChatCommand::Start).await;
        h.tap(USER, "start").await;
        let seeded = vec![Selection::Picked("x".into()), Selection::Picked("y".into())];
        db::save_progress(&h.pool, USER, 0, Some("M"), None, Some(&seeded)).await.unwrap();
        h.gateway.take();

        h.text(USER, "лишнее").await;
        assert_eq!(texts(&h.gateway.take()), vec!["Можно выбрать не более 2"]);
        assert_eq!(db::get_multi_selected(&h.pool, USER).await.unwrap(), seeded);
        assert!(h.draft_answers().await.is_empty());
        assert_eq!(h.current_index(USER).await, 0);
    }

    #[tokio::test]
    async fn command_is_not_stored_as_text_answer() {
        let mut h = Harness::new().await;
        h.command(USER, ChatCommand::Start).await;
        h.tap(USER, "start").await;
        h.tap(USER, "ans:Q1:s:a").await;
        h.tap(USER, "ans:Q2:m:x").await;
        h.tap(USER, "ans:Q2:m:z").await;
        h.tap(USER, "ans:Q3:r:7").await;
        h.gateway.take();

        h.command(USER, ChatCommand::Restart).await;
        assert_eq!(h.draft_answers().await.len(), 3);
        assert_eq!(h.current_index(USER).await, 3);

        h.command(ADMIN, ChatCommand::AdminAdd(Some(USER.to_string()))).await;
        assert_eq!(
            texts(&h.gateway.take()).last(),
            Some(&"Пользователь 100 назначен администратором.")
        );
        assert!(db::is_admin(&h.pool, USER).await.unwrap());
    }

    #[test]
    fn listener_guard_is_exclusive() {
        let guard = ListenerGuard::acquire().unwrap();
        assert!(ListenerGuard::acquire().is_none());
        drop(guard);
        assert!(ListenerGuard::acquire().is_some());
    }

    #[test]
    fn recent_updates_forget_oldest() {
        let mut recent = RecentUpdates::default();
        for id in 0..DEDUP_CAPACITY as u32 {
            assert!(recent.insert(id));
        }
        assert!(!recent.insert(5));
        assert!(recent.insert(DEDUP_CAPACITY as u32));
        assert!(recent.insert(0));
    }
}
