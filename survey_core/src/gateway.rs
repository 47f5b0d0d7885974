use async_trait::async_trait;
use thiserror::Error;

use crate::UserInfo;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl GatewayError {
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        GatewayError::Transport(Box::new(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub text: String,
    pub data: String,
}

impl Button {
    pub fn new(text: impl Into<String>, data: impl Into<String>) -> Self {
        Button { text: text.into(), data: data.into() }
    }
}

/// Inline-клавиатура: строки кнопок с callback-данными.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(mut self, row: Vec<Button>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn buttons(&self) -> impl Iterator<Item = &Button> {
        self.rows.iter().flatten()
    }
}

/// Входящий апдейт, уже отвязанный от конкретного мессенджера.
#[derive(Debug, Clone)]
pub struct InboundUpdate {
    pub id: u32,
    pub kind: InboundKind,
}

#[derive(Debug, Clone)]
pub enum InboundKind {
    Message(IncomingMessage),
    Callback(IncomingCallback),
}

/// Команда чата, уже разобранная транспортом. Пустой аргумент приходит как `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Start,
    Restart,
    ResetMe,
    Admin,
    AdminAdd(Option<String>),
    User(Option<String>),
}

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub from: UserInfo,
    pub text: Option<String>,
    pub command: Option<ChatCommand>,
}

#[derive(Debug, Clone)]
pub struct IncomingCallback {
    pub id: String,
    pub chat_id: i64,
    pub message_id: Option<i32>,
    pub from: UserInfo,
    pub data: Option<String>,
}

/// Исходящая сторона чата. Тексты размечены HTML.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<i32, GatewayError>;

    async fn send_text_with_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: &Keyboard,
    ) -> Result<i32, GatewayError>;

    async fn edit_text(&self, chat_id: i64, message_id: i32, text: &str) -> Result<(), GatewayError>;

    async fn edit_text_with_keyboard(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
        keyboard: &Keyboard,
    ) -> Result<(), GatewayError>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), GatewayError>;

    async fn send_document(
        &self,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), GatewayError>;
}
