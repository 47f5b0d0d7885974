use teloxide::utils::html;

use crate::callback::{AnswerKind, CallbackData};
use crate::gateway::{Button, Keyboard};
use crate::{AnswerValue, Question, QuestionKind, Selection, Survey};

pub const OTHER_HINT: &str = "Можете написать свой вариант ответа в чат.";
pub const OTHER_PROMPT: &str = "Напишите свой вариант:";
pub const TEXT_HINT_BUTTON: &str = "Напишите ответ текстом";
pub const NOOP: &str = "noop";

/// Текст вопроса с подсказкой про «Другое» и текущим MULTI-выбором.
pub fn question_text(question: &Question, selection: &[Selection]) -> String {
    let mut text = html::escape(&question.text);
    if question.has_other() {
        text.push_str("\n\n");
        text.push_str(&html::italic(OTHER_HINT));
    }
    if let QuestionKind::Multi { max, .. } = &question.kind {
        text.push_str(&format!("\n\nВыбрано: {} / {}", selection.len(), max));
        for item in selection {
            text.push_str("\n• ");
            text.push_str(&html::escape(&item.label(question)));
        }
    }
    text
}

pub fn question_keyboard(question: &Question, selection: &[Selection]) -> Keyboard {
    let answer = |kind: AnswerKind, payload: &str| CallbackData::answer(&question.id, kind, payload).to_string();

    match &question.kind {
        QuestionKind::Single { options } => options.iter().fold(Keyboard::new(), |kb, o| {
            kb.row(vec![Button::new(o.text.clone(), answer(AnswerKind::Single, &o.id))])
        }),
        QuestionKind::Multi { options, .. } => {
            let plain = options.iter().filter(|o| !o.other).map(|o| {
                let picked = selection.contains(&Selection::Picked(o.id.clone()));
                let label = if picked { format!("✅ {}", o.text) } else { o.text.clone() };
                Button::new(label, answer(AnswerKind::Multi, &o.id))
            });
            let other = options
                .iter()
                .filter(|o| o.other)
                .map(|o| Button::new(o.text.clone(), answer(AnswerKind::Multi, &o.id)));
            plain.chain(other).fold(Keyboard::new(), |kb, b| kb.row(vec![b]))
        }
        QuestionKind::Rating => {
            let row = |range: std::ops::RangeInclusive<u8>| -> Vec<Button> {
                range
                    .map(|v| Button::new(v.to_string(), answer(AnswerKind::Rating, &v.to_string())))
                    .collect()
            };
            Keyboard::new().row(row(1..=5)).row(row(6..=10))
        }
        QuestionKind::Text => Keyboard::new().row(vec![Button::new(TEXT_HINT_BUTTON, NOOP)]),
    }
}

/// Правка отвеченного вопроса: текст вопроса и выбранный ответ.
pub fn answer_summary(question: &Question, value: &AnswerValue) -> String {
    let question_text = html::escape(&question.text);
    match value {
        AnswerValue::Text(text) => format!(
            "{}\n\n{} {}",
            question_text,
            html::bold("Ваш ответ:"),
            html::bold(&html::escape(text))
        ),
        AnswerValue::Options(labels) => {
            let joined = labels
                .iter()
                .map(|l| html::bold(&html::escape(l)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}\n\n{} {}", question_text, html::bold("Ваши ответы:"), joined)
        }
    }
}

pub fn welcome_text(survey: &Survey) -> String {
    format!("{}\n\n{}", html::bold(&html::escape(&survey.title)), html::escape(&survey.welcome))
}

pub fn start_keyboard(survey: &Survey) -> Keyboard {
    Keyboard::new().row(vec![Button::new(survey.start_button.clone(), CallbackData::Start.to_string())])
}

pub fn admin_menu() -> Keyboard {
    Keyboard::new()
        .row(vec![Button::new("📊 Статистика", CallbackData::AdminStats.to_string())])
        .row(vec![Button::new("👥 Пользователи", CallbackData::AdminUsers.to_string())])
        .row(vec![Button::new("📥 Выгрузка CSV", CallbackData::AdminExport.to_string())])
}

fn back_to_panel() -> Button {
    Button::new("⬅️ В админ-панель", CallbackData::AdminMenu.to_string())
}

/// Навигация по страницам статистики.
pub fn stats_nav(next_page: Option<usize>) -> Keyboard {
    let kb = match next_page {
        Some(page) => Keyboard::new().row(vec![Button::new("Дальше ➡️", CallbackData::AdminStatsNext(page).to_string())]),
        None => Keyboard::new(),
    };
    kb.row(vec![back_to_panel()])
}

pub fn users_nav(next_page: Option<usize>) -> Keyboard {
    let kb = match next_page {
        Some(page) => Keyboard::new().row(vec![Button::new(
            "Следующая страница ➡️",
            CallbackData::AdminUsersPage(page).to_string(),
        )]),
        None => Keyboard::new(),
    };
    kb.row(vec![back_to_panel()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::questionnaire::TEST_SURVEY;

    fn survey() -> Survey {
        Survey::from_json(TEST_SURVEY).unwrap()
    }

    fn data(kb: &Keyboard) -> Vec<&str> {
        kb.buttons().map(|b| b.data.as_str()).collect()
    }

    #[test]
    fn single_keyboard_offers_every_option() {
        let survey = survey();
        let kb = question_keyboard(&survey.questions[0], &[]);
        assert_eq!(data(&kb), vec!["ans:Q1:s:a", "ans:Q1:s:b", "ans:Q1:s:other"]);
        assert!(question_text(&survey.questions[0], &[]).contains(OTHER_HINT));
    }

    #[test]
    fn multi_marks_selected_options() {
        let survey = survey();
        let q2 = &survey.questions[1];
        let selection = vec![Selection::Picked("y".to_string())];
        let kb = question_keyboard(q2, &selection);
        let labels: Vec<&str> = kb.buttons().map(|b| b.text.as_str()).collect();
        assert_eq!(labels, vec!["X", "✅ Y", "Z"]);

        let text = question_text(q2, &selection);
        assert!(text.ends_with("Выбрано: 1 / 2\n• Y"));
    }

    #[test]
    fn rating_keyboard_has_two_rows() {
        let survey = survey();
        let kb = question_keyboard(&survey.questions[2], &[]);
        assert_eq!(kb.rows.len(), 2);
        assert_eq!(kb.rows[0].len(), 5);
        assert_eq!(kb.rows[1][4].data, "ans:Q3:r:10");
    }

    #[test]
    fn text_keyboard_is_a_hint() {
        let survey = survey();
        let kb = question_keyboard(&survey.questions[3], &[]);
        assert_eq!(data(&kb), vec![NOOP]);
    }

    #[test]
    fn summary_formats_single_and_multi() {
        let survey = survey();
        let single = answer_summary(&survey.questions[0], &AnswerValue::Text("A<1>".into()));
        assert_eq!(single, "Первый вопрос\n\n<b>Ваш ответ:</b> <b>A&lt;1&gt;</b>");
        let multi = answer_summary(&survey.questions[1], &AnswerValue::Options(vec!["X".into(), "Z".into()]));
        assert_eq!(multi, "Второй вопрос\n\n<b>Ваши ответы:</b> <b>X</b>, <b>Z</b>");
    }

    #[test]
    fn navigation_buttons() {
        assert_eq!(data(&stats_nav(Some(2))), vec!["admin:stats:next:2", "admin:menu"]);
        assert_eq!(data(&users_nav(None)), vec!["admin:menu"]);
    }
}
