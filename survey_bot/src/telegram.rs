use async_trait::async_trait;
use survey_core::UserInfo;
use survey_core::gateway::{
    ChatCommand, ChatGateway, GatewayError, InboundKind, InboundUpdate, IncomingCallback, IncomingMessage, Keyboard,
};
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQueryId, InlineKeyboardButton, InlineKeyboardButtonKind, InlineKeyboardMarkup, InputFile, MessageId,
    ParseMode, UpdateKind, User,
};
use teloxide::utils::command::{BotCommands, ParseError};
use teloxide::{ApiError, RequestError};

/// Команды чата. Скрытые не попадают в меню клиента.
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Доступные команды:")]
pub enum BotCommand {
    #[command(description = "Начать анкетирование.")]
    Start,
    #[command(description = "Показать текущий вопрос.")]
    Restart,
    #[command(description = "Админ-панель.")]
    Admin,
    #[command(hide)]
    ResetMe,
    #[command(hide, parse_with = optional_arg)]
    AdminAdd(Option<String>),
    #[command(hide, parse_with = optional_arg)]
    User(Option<String>),
}

fn optional_arg(input: String) -> Result<(Option<String>,), ParseError> {
    let arg = input.split_whitespace().next().map(str::to_string);
    Ok((arg,))
}

impl From<BotCommand> for ChatCommand {
    fn from(command: BotCommand) -> Self {
        match command {
            BotCommand::Start => ChatCommand::Start,
            BotCommand::Restart => ChatCommand::Restart,
            BotCommand::Admin => ChatCommand::Admin,
            BotCommand::ResetMe => ChatCommand::ResetMe,
            BotCommand::AdminAdd(arg) => ChatCommand::AdminAdd(arg),
            BotCommand::User(arg) => ChatCommand::User(arg),
        }
    }
}

// Чужая или неизвестная команда остаётся обычным текстом.
fn parse_command(text: &str, bot_username: &str) -> Option<ChatCommand> {
    BotCommand::parse(text.trim(), bot_username).ok().map(ChatCommand::from)
}

/// `ChatGateway` поверх Telegram Bot API.
#[derive(Clone)]
pub struct TelegramGateway {
    bot: Bot,
}

impl TelegramGateway {
    pub fn new(bot: Bot) -> Self {
        TelegramGateway { bot }
    }
}

fn markup(keyboard: &Keyboard) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(keyboard.rows.iter().map(|row| {
        row.iter()
            .map(|b| InlineKeyboardButton::new(b.text.clone(), InlineKeyboardButtonKind::CallbackData(b.data.clone())))
            .collect::<Vec<_>>()
    }))
}

// Правка без изменений для Telegram ошибка, для нас нет.
fn edited(result: Result<Message, RequestError>) -> Result<(), GatewayError> {
    match result {
        Ok(_) | Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
        Err(e) => Err(GatewayError::transport(e)),
    }
}

#[async_trait]
impl ChatGateway for TelegramGateway {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<i32, GatewayError> {
        let msg = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await
            .map_err(GatewayError::transport)?;
        Ok(msg.id.0)
    }

    async fn send_text_with_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: &Keyboard,
    ) -> Result<i32, GatewayError> {
        let msg = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .reply_markup(markup(keyboard))
            .await
            .map_err(GatewayError::transport)?;
        Ok(msg.id.0)
    }

    async fn edit_text(&self, chat_id: i64, message_id: i32, text: &str) -> Result<(), GatewayError> {
        edited(
            self.bot
                .edit_message_text(ChatId(chat_id), MessageId(message_id), text)
                .parse_mode(ParseMode::Html)
                .await,
        )
    }

    async fn edit_text_with_keyboard(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
        keyboard: &Keyboard,
    ) -> Result<(), GatewayError> {
        edited(
            self.bot
                .edit_message_text(ChatId(chat_id), MessageId(message_id), text)
                .parse_mode(ParseMode::Html)
                .reply_markup(markup(keyboard))
                .await,
        )
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), GatewayError> {
        let mut request = self.bot.answer_callback_query(CallbackQueryId(callback_id.to_owned()));
        if let Some(text) = text {
            request = request.text(text);
        }
        request.await.map_err(GatewayError::transport)?;
        Ok(())
    }

    async fn send_document(&self, chat_id: i64, file_name: &str, bytes: Vec<u8>) -> Result<(), GatewayError> {
        self.bot
            .send_document(ChatId(chat_id), InputFile::memory(bytes).file_name(file_name.to_owned()))
            .await
            .map_err(GatewayError::transport)?;
        Ok(())
    }
}

fn user_info(user: &User) -> UserInfo {
    UserInfo {
        tg_id: user.id.0 as i64,
        first_name: Some(user.first_name.clone()),
        last_name: user.last_name.clone(),
        username: user.username.clone(),
    }
}

/// Апдейт Telegram во внутреннее событие. Прочие виды апдейтов отбрасываются.
pub fn inbound(update: &Update, bot_username: &str) -> Option<InboundUpdate> {
    let kind = match &update.kind {
        UpdateKind::Message(msg) => InboundKind::Message(IncomingMessage {
            chat_id: msg.chat.id.0,
            from: user_info(msg.from.as_ref()?),
            text: msg.text().map(str::to_string),
            command: msg.text().and_then(|text| parse_command(text, bot_username)),
        }),
        UpdateKind::CallbackQuery(q) => {
            let from = user_info(&q.from);
            // без сообщения (inline-режим) отвечаем в личку
            let chat_id = q.message.as_ref().map(|m| m.chat().id.0).unwrap_or(from.tg_id);
            InboundKind::Callback(IncomingCallback {
                id: q.id.0.clone(),
                chat_id,
                message_id: q.message.as_ref().map(|m| m.id().0),
                from,
                data: q.data.clone(),
            })
        }
        _ => return None,
    };
    Some(InboundUpdate { id: update.id.0, kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("/start", "SurveyBot"), Some(ChatCommand::Start));
        assert_eq!(parse_command("/resetme", "SurveyBot"), Some(ChatCommand::ResetMe));
        assert_eq!(parse_command("/start@SurveyBot", "SurveyBot"), Some(ChatCommand::Start));
        assert_eq!(
            parse_command("/adminadd 42", "SurveyBot"),
            Some(ChatCommand::AdminAdd(Some("42".to_string())))
        );
        assert_eq!(parse_command("/user", "SurveyBot"), Some(ChatCommand::User(None)));
    }

    #[test]
    fn leaves_plain_text_and_foreign_commands() {
        assert_eq!(parse_command("hello", "SurveyBot"), None);
        assert_eq!(parse_command("/start@OtherBot", "SurveyBot"), None);
        assert_eq!(parse_command("/unknown", "SurveyBot"), None);
    }

    #[test]
    fn menu_lists_visible_commands_only() {
        let names: Vec<String> = BotCommand::bot_commands()
            .into_iter()
            .map(|c| c.command.trim_start_matches('/').to_string())
            .collect();
        assert_eq!(names, vec!["start", "restart", "admin"]);
    }
}
