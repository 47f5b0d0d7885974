use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerKind {
    Single,
    Multi,
    Rating,
}

impl AnswerKind {
    fn tag(self) -> &'static str {
        match self {
            AnswerKind::Single => "s",
            AnswerKind::Multi => "m",
            AnswerKind::Rating => "r",
        }
    }
}

/// Данные inline-кнопок. Неизвестные строки разбираются в `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackData {
    Start,
    AdminMenu,
    AdminStats,
    AdminStatsNext(usize),
    AdminUsers,
    AdminUsersPage(usize),
    AdminExport,
    Answer {
        question_id: String,
        kind: AnswerKind,
        payload: String,
    },
    Unknown(String),
}

impl CallbackData {
    pub fn answer(question_id: &str, kind: AnswerKind, payload: impl fmt::Display) -> Self {
        CallbackData::Answer {
            question_id: question_id.to_string(),
            kind,
            payload: payload.to_string(),
        }
    }

    fn parse(data: &str) -> Option<Self> {
        match data {
            "start" => return Some(CallbackData::Start),
            "admin:menu" => return Some(CallbackData::AdminMenu),
            "admin:stats" => return Some(CallbackData::AdminStats),
            "admin:users" => return Some(CallbackData::AdminUsers),
            "admin:export" => return Some(CallbackData::AdminExport),
            _ => {}
        }

        if let Some(page) = data.strip_prefix("admin:stats:next:") {
            return page.parse().ok().map(CallbackData::AdminStatsNext);
        }
        if let Some(page) = data.strip_prefix("admin:users:page:") {
            return page.parse().ok().map(CallbackData::AdminUsersPage);
        }

        let rest = data.strip_prefix("ans:")?;
        let mut parts = rest.splitn(3, ':');
        let question_id = parts.next().filter(|s| !s.is_empty())?;
        let kind = match parts.next()? {
            "s" => AnswerKind::Single,
            "m" => AnswerKind::Multi,
            "r" => AnswerKind::Rating,
            _ => return None,
        };
        let payload = parts.next().filter(|s| !s.is_empty())?;
        Some(CallbackData::answer(question_id, kind, payload))
    }
}

impl FromStr for CallbackData {
    type Err = std::convert::Infallible;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(data).unwrap_or_else(|| CallbackData::Unknown(data.to_string())))
    }
}

impl fmt::Display for CallbackData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackData::Start => f.write_str("start"),
            CallbackData::AdminMenu => f.write_str("admin:menu"),
            CallbackData::AdminStats => f.write_str("admin:stats"),
            CallbackData::AdminStatsNext(page) => write!(f, "admin:stats:next:{}", page),
            CallbackData::AdminUsers => f.write_str("admin:users"),
            CallbackData::AdminUsersPage(page) => write!(f, "admin:users:page:{}", page),
            CallbackData::AdminExport => f.write_str("admin:export"),
            CallbackData::Answer { question_id, kind, payload } => {
                write!(f, "ans:{}:{}:{}", question_id, kind.tag(), payload)
            }
            CallbackData::Unknown(raw) => f.write_str(raw),
        }
    }
}
