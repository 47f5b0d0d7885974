use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Префикс, под которым хранится свободный ответ «Другое».
pub const OTHER_PREFIX: &str = "Другое: ";

const EMBEDDED_SURVEY: &str = include_str!("../resources/survey.json");

#[derive(Debug, Error)]
pub enum QuestionnaireError {
    #[error("failed to read questionnaire: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse questionnaire: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid questionnaire: {0}")]
    Invalid(String),
}

/// Анкета целиком. Загружается один раз и дальше только читается.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Survey {
    pub title: String,
    pub welcome: String,
    pub start_button: String,
    pub finish: String,
    pub questions: Vec<Question>,
}

// Документ как он лежит в JSON; проверки идут уже после разбора.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SurveyDoc {
    title: String,
    welcome: String,
    start_button: String,
    finish: String,
    questions: Vec<QuestionDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Choice {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub other: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionKind {
    Single { options: Vec<Choice> },
    Multi { options: Vec<Choice>, max: usize },
    Rating,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "QuestionDoc")]
pub struct Question {
    pub id: String,
    pub text: String,
    pub kind: QuestionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum QuestionType {
    #[serde(rename = "SINGLE")]
    Single,
    #[serde(rename = "MULTI")]
    Multi,
    #[serde(rename = "RATING_1_10")]
    Rating,
    #[serde(rename = "TEXT")]
    Text,
}

// Форма вопроса в JSON-документе.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuestionDoc {
    id: String,
    #[serde(rename = "type")]
    kind: QuestionType,
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<Vec<Choice>>,
}

impl TryFrom<QuestionDoc> for Question {
    type Error = QuestionnaireError;

    fn try_from(doc: QuestionDoc) -> Result<Self, Self::Error> {
        let invalid = |reason: &str| QuestionnaireError::Invalid(format!("question {}: {}", doc.id, reason));

        let kind = match doc.kind {
            QuestionType::Single | QuestionType::Multi => {
                let options = doc.options.clone().unwrap_or_default();
                if options.is_empty() {
                    return Err(invalid("options are required"));
                }
                let mut seen = HashSet::new();
                if let Some(dup) = options.iter().find(|o| !seen.insert(o.id.as_str())) {
                    return Err(invalid(&format!("duplicate option id {}", dup.id)));
                }
                if doc.kind == QuestionType::Single {
                    QuestionKind::Single { options }
                } else {
                    let max = match doc.max {
                        Some(max) if max >= 1 => max,
                        _ => return Err(invalid("MULTI requires max >= 1")),
                    };
                    // без «Другое» набрать max можно только из обычных опций
                    let plain = options.iter().filter(|o| !o.other).count();
                    if max > plain && !options.iter().any(|o| o.other) {
                        return Err(invalid(&format!("max {} exceeds {} options", max, plain)));
                    }
                    QuestionKind::Multi { options, max }
                }
            }
            QuestionType::Rating | QuestionType::Text => {
                if doc.options.as_ref().is_some_and(|o| !o.is_empty()) {
                    return Err(invalid("options are not allowed here"));
                }
                if doc.kind == QuestionType::Rating {
                    QuestionKind::Rating
                } else {
                    QuestionKind::Text
                }
            }
        };

        Ok(Question { id: doc.id, text: doc.text, kind })
    }
}

impl From<Question> for QuestionDoc {
    fn from(q: Question) -> Self {
        let (kind, max, options) = match q.kind {
            QuestionKind::Single { options } => (QuestionType::Single, None, Some(options)),
            QuestionKind::Multi { options, max } => (QuestionType::Multi, Some(max), Some(options)),
            QuestionKind::Rating => (QuestionType::Rating, None, None),
            QuestionKind::Text => (QuestionType::Text, None, None),
        };
        QuestionDoc { id: q.id, kind, text: q.text, max, options }
    }
}

impl TryFrom<SurveyDoc> for Survey {
    type Error = QuestionnaireError;

    fn try_from(doc: SurveyDoc) -> Result<Self, Self::Error> {
        let questions = doc
            .questions
            .into_iter()
            .map(Question::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Survey {
            title: doc.title,
            welcome: doc.welcome,
            start_button: doc.start_button,
            finish: doc.finish,
            questions,
        })
    }
}

impl Question {
    pub fn options(&self) -> &[Choice] {
        match &self.kind {
            QuestionKind::Single { options } | QuestionKind::Multi { options, .. } => options,
            QuestionKind::Rating | QuestionKind::Text => &[],
        }
    }

    pub fn option(&self, option_id: &str) -> Option<&Choice> {
        self.options().iter().find(|o| o.id == option_id)
    }

    pub fn has_other(&self) -> bool {
        self.options().iter().any(|o| o.other)
    }

    /// Можно ли ответить на вопрос текстом в чат.
    pub fn accepts_free_text(&self) -> bool {
        matches!(self.kind, QuestionKind::Text) || self.has_other()
    }

    /// Текст опции по id; неизвестный id возвращается как есть.
    pub fn option_label<'a>(&'a self, option_id: &'a str) -> &'a str {
        self.option(option_id).map(|o| o.text.as_str()).unwrap_or(option_id)
    }
}

impl Survey {
    pub fn from_json(json: &str) -> Result<Self, QuestionnaireError> {
        let doc: SurveyDoc = serde_json::from_str(json)?;
        let survey = Survey::try_from(doc)?;
        survey.validate()?;
        Ok(survey)
    }

    pub fn from_path(path: &Path) -> Result<Self, QuestionnaireError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Анкета, вшитая в бинарник.
    pub fn embedded() -> Result<Self, QuestionnaireError> {
        Self::from_json(EMBEDDED_SURVEY)
    }

    pub fn load(path: Option<&Path>) -> Result<Self, QuestionnaireError> {
        match path {
            Some(path) => Self::from_path(path),
            None => Self::embedded(),
        }
    }

    fn validate(&self) -> Result<(), QuestionnaireError> {
        if self.questions.is_empty() {
            return Err(QuestionnaireError::Invalid("no questions".to_string()));
        }
        let mut seen = HashSet::new();
        for q in &self.questions {
            if !seen.insert(q.id.as_str()) {
                return Err(QuestionnaireError::Invalid(format!("duplicate question id {}", q.id)));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    pub fn question_at(&self, index: usize) -> Option<&Question> {
        self.questions.get(index)
    }

    pub fn question(&self, question_id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == question_id)
    }
}

#[cfg(test)]
pub(crate) const TEST_SURVEY: &str = r#"{
  "title": "Тест",
  "welcome": "Добро пожаловать",
  "startButton": "Начать",
  "finish": "Спасибо!",
  "questions": [
    {"id": "Q1", "type": "SINGLE", "text": "Первый вопрос", "options": [
      {"id": "a", "text": "A-label"},
      {"id": "b", "text": "B-label"},
      {"id": "other", "text": "Другое", "other": true}
    ]},
    {"id": "Q2", "type": "MULTI", "text": "Второй вопрос", "max": 2, "options": [
      {"id": "x", "text": "X"},
      {"id": "y", "text": "Y"},
      {"id": "z", "text": "Z"}
    ]},
    {"id": "Q3", "type": "RATING_1_10", "text": "Оценка"},
    {"id": "Q4", "type": "TEXT", "text": "Комментарий"}
  ]
}"#;

/// MULTI с опцией «Другое» и текстовый вопрос за ним.
#[cfg(test)]
pub(crate) const MULTI_OTHER_SURVEY: &str = r#"{
  "title": "Тест",
  "welcome": "Добро пожаловать",
  "startButton": "Начать",
  "finish": "Готово",
  "questions": [
    {"id": "M", "type": "MULTI", "text": "Что выбрать?", "max": 2, "options": [
      {"id": "x", "text": "X"},
      {"id": "y", "text": "Y"},
      {"id": "other", "text": "Другое", "other": true}
    ]},
    {"id": "T", "type": "TEXT", "text": "Комментарий"}
  ]
}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_survey_is_valid() {
        let survey = Survey::embedded().unwrap();
        assert!(!survey.is_empty());
        assert!(!survey.start_button.is_empty());
    }

    #[test]
    fn parses_all_question_kinds() {
        let survey = Survey::from_json(TEST_SURVEY).unwrap();
        assert_eq!(survey.len(), 4);
        assert!(matches!(survey.questions[0].kind, QuestionKind::Single { .. }));
        assert!(matches!(survey.questions[1].kind, QuestionKind::Multi { max: 2, .. }));
        assert_eq!(survey.questions[2].kind, QuestionKind::Rating);
        assert_eq!(survey.questions[3].kind, QuestionKind::Text);

        let q1 = survey.question("Q1").unwrap();
        assert!(q1.has_other());
        assert!(q1.accepts_free_text());
        assert_eq!(q1.option_label("a"), "A-label");
        assert_eq!(q1.option_label("missing"), "missing");
        assert!(!survey.question("Q2").unwrap().accepts_free_text());
        assert!(survey.question("Q4").unwrap().accepts_free_text());
    }

    #[test]
    fn serializes_fields_in_document_order() {
        let survey = Survey::from_json(TEST_SURVEY).unwrap();
        let json = serde_json::to_string(&survey.questions[1]).unwrap();
        assert!(json.starts_with(r#"{"id":"Q2","type":"MULTI","text":"Второй вопрос","max":2,"options":["#));
        let json = serde_json::to_string(&survey).unwrap();
        let title = json.find("\"title\"").unwrap();
        let questions = json.find("\"questions\"").unwrap();
        assert!(title < questions);
    }

    #[test]
    fn rejects_multi_without_max() {
        let json = r#"{"title":"t","welcome":"w","startButton":"s","finish":"f","questions":[
            {"id":"q","type":"MULTI","text":"?","options":[{"id":"a","text":"A"}]}]}"#;
        assert!(matches!(Survey::from_json(json), Err(QuestionnaireError::Invalid(_))));
    }

    #[test]
    fn rejects_unreachable_multi_max() {
        let json = r#"{"title":"t","welcome":"w","startButton":"s","finish":"f","questions":[
            {"id":"q","type":"MULTI","text":"?","max":3,"options":[{"id":"a","text":"A"},{"id":"b","text":"B"}]}]}"#;
        assert!(matches!(Survey::from_json(json), Err(QuestionnaireError::Invalid(_))));

        // с «Другое» недостающее добирается свободным текстом
        let json = r#"{"title":"t","welcome":"w","startButton":"s","finish":"f","questions":[
            {"id":"q","type":"MULTI","text":"?","max":3,"options":[{"id":"a","text":"A"},{"id":"o","text":"Другое","other":true}]}]}"#;
        assert!(Survey::from_json(json).is_ok());
    }

    #[test]
    fn rejects_malformed_json() {
        let json = r#"{"title":"t","questions":[]}"#;
        assert!(matches!(Survey::from_json(json), Err(QuestionnaireError::Parse(_))));
        assert!(Survey::from_json(MULTI_OTHER_SURVEY).unwrap().questions[0].has_other());
    }

    #[test]
    fn rejects_duplicate_question_ids() {
        let json = r#"{"title":"t","welcome":"w","startButton":"s","finish":"f","questions":[
            {"id":"q","type":"TEXT","text":"?"},{"id":"q","type":"TEXT","text":"?"}]}"#;
        assert!(matches!(Survey::from_json(json), Err(QuestionnaireError::Invalid(_))));
    }
}
