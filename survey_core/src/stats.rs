use sqlx::SqlitePool;
use teloxide::utils::html;

use crate::{db, CompletedAnswer, Question, QuestionKind, Survey, OTHER_PREFIX};

/// Максимальная длина одного сообщения со статистикой.
pub const MAX_CHUNK_CHARS: usize = 3800;

const NO_TEXT: &str = "(без текста)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub label: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tally {
    /// Счётчики по вариантам и отдельно по свободным ответам «Другое».
    Counts { buckets: Vec<Bucket>, other: Vec<Bucket> },
    Texts(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionStats {
    pub question_id: String,
    pub question_text: String,
    pub tally: Tally,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReport {
    pub completed: i64,
    pub questions: Vec<QuestionStats>,
}

/// Процент от числа завершивших, округлённый до целого.
pub fn percent(count: u32, completed: i64) -> i64 {
    (f64::from(count) * 100.0 / completed.max(1) as f64).round() as i64
}

fn bump(buckets: &mut Vec<Bucket>, label: &str) {
    match buckets.iter_mut().find(|b| b.label == label) {
        Some(bucket) => bucket.count += 1,
        None => buckets.push(Bucket { label: label.to_string(), count: 1 }),
    }
}

fn option_buckets(question: &Question) -> Vec<Bucket> {
    question
        .options()
        .iter()
        .filter(|o| !o.other)
        .map(|o| Bucket { label: o.text.clone(), count: 0 })
        .collect()
}

// Раскладывает значение по вариантам или в «Другое».
fn tally_value(value: &str, buckets: &mut Vec<Bucket>, other: &mut Vec<Bucket>) {
    match value.strip_prefix(OTHER_PREFIX) {
        Some(payload) => {
            let payload = payload.trim();
            bump(other, if payload.is_empty() { NO_TEXT } else { payload });
        }
        None => bump(buckets, value),
    }
}

fn tally_question(question: &Question, rows: &[&CompletedAnswer]) -> Tally {
    match &question.kind {
        QuestionKind::Single { .. } => {
            let mut buckets = option_buckets(question);
            let mut other = Vec::new();
            for row in rows {
                let text = row.answer_text.as_deref().unwrap_or("(пусто)");
                tally_value(text, &mut buckets, &mut other);
            }
            Tally::Counts { buckets, other }
        }
        QuestionKind::Multi { .. } => {
            let mut buckets = option_buckets(question);
            let mut other = Vec::new();
            for row in rows {
                let Some(json) = row.option_ids_json.as_deref() else { continue };
                let Ok(labels) = serde_json::from_str::<Vec<String>>(json) else { continue };
                for label in &labels {
                    tally_value(label, &mut buckets, &mut other);
                }
            }
            Tally::Counts { buckets, other }
        }
        QuestionKind::Rating => {
            let mut buckets: Vec<Bucket> = (1..=10)
                .map(|v: u8| Bucket { label: v.to_string(), count: 0 })
                .collect();
            for row in rows {
                let value = row.answer_text.as_deref().and_then(|t| t.trim().parse::<usize>().ok());
                if let Some(bucket) = value.filter(|v| (1..=10).contains(v)).map(|v| &mut buckets[v - 1]) {
                    bucket.count += 1;
                }
            }
            Tally::Counts { buckets, other: Vec::new() }
        }
        QuestionKind::Text => Tally::Texts(
            rows.iter()
                .map(|row| match row.answer_text.as_deref().map(str::trim) {
                    Some(text) if !text.is_empty() => text.to_string(),
                    _ => NO_TEXT.to_string(),
                })
                .collect(),
        ),
    }
}

/// Сводка по всем вопросам. Чистая функция над строками ответов.
pub fn aggregate(survey: &Survey, completed: i64, rows: &[CompletedAnswer]) -> StatsReport {
    let questions = survey
        .questions
        .iter()
        .map(|question| {
            let own: Vec<&CompletedAnswer> = rows.iter().filter(|r| r.question_id == question.id).collect();
            QuestionStats {
                question_id: question.id.clone(),
                question_text: question.text.clone(),
                tally: tally_question(question, &own),
            }
        })
        .collect();

    StatsReport { completed, questions }
}

pub async fn load_report(pool: &SqlitePool, survey: &Survey) -> StatsReport {
    let completed = db::count_completed(pool).await;
    let rows = db::get_all_completed_answers(pool).await;
    aggregate(survey, completed, &rows)
}

impl StatsReport {
    /// Страница 0: число завершивших, далее по странице на вопрос.
    pub fn total_pages(&self) -> usize {
        1 + self.questions.len()
    }

    pub fn render_page(&self, page: usize) -> String {
        if page == 0 {
            return format!("Завершили опрос: {}", self.completed);
        }
        let Some(stats) = self.questions.get(page - 1) else {
            return "Нет такой страницы.".to_string();
        };

        let mut out = format!("• {}\n\n", html::escape(&stats.question_text));
        match &stats.tally {
            Tally::Counts { buckets, other } => {
                for b in buckets {
                    out.push_str(&format!(
                        "{} — {} голосов ({}%)\n",
                        html::escape(&b.label),
                        b.count,
                        percent(b.count, self.completed)
                    ));
                }
                for b in other {
                    out.push_str(&format!(
                        "Другое ({}) — {} голосов ({}%)\n",
                        html::escape(&b.label),
                        b.count,
                        percent(b.count, self.completed)
                    ));
                }
            }
            Tally::Texts(texts) if texts.is_empty() => out.push_str("— нет данных"),
            Tally::Texts(texts) => {
                for text in texts {
                    out.push_str(&format!("— {}\n", html::escape(text)));
                }
            }
        }
        out
    }

    /// CSV для выгрузки: `;` как разделитель, BOM для Excel.
    pub fn to_csv(&self) -> Vec<u8> {
        let mut out = String::from("\u{feff}question_id;question;answer;count;percent\n");
        let mut line = |fields: [&str; 5]| {
            let cells: Vec<String> = fields.iter().map(|f| csv_cell(f)).collect();
            out.push_str(&cells.join(";"));
            out.push('\n');
        };

        line(["", "Завершили опрос", "", &self.completed.to_string(), ""]);
        for stats in &self.questions {
            match &stats.tally {
                Tally::Counts { buckets, other } => {
                    for b in buckets {
                        let pct = percent(b.count, self.completed).to_string();
                        line([&stats.question_id, &stats.question_text, &b.label, &b.count.to_string(), &pct]);
                    }
                    for b in other {
                        let label = format!("{OTHER_PREFIX}{}", b.label);
                        let pct = percent(b.count, self.completed).to_string();
                        line([&stats.question_id, &stats.question_text, &label, &b.count.to_string(), &pct]);
                    }
                }
                Tally::Texts(texts) => {
                    for text in texts {
                        line([&stats.question_id, &stats.question_text, text, "", ""]);
                    }
                }
            }
        }
        out.into_bytes()
    }
}

fn csv_cell(value: &str) -> String {
    if value.contains([';', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Режет длинный текст на куски не длиннее `max_chars` символов по границам строк.
pub fn split_by_size(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let line_len = line.chars().count();
        if current_len > 0 && current_len + 1 + line_len > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > max_chars {
            // строка длиннее лимита режется по символам
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_chars) {
                if current_len > 0 {
                    chunks.push(std::mem::take(&mut current));
                }
                current = piece.iter().collect();
                current_len = piece.len();
            }
            continue;
        }
        if current_len > 0 {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if current_len > 0 {
        chunks.push(current);
    }
    chunks
}
