use std::collections::HashMap;

use serde::Serialize;

use crate::db::operations::questions::{Question, QuestionKind};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResult {
    pub question_id: String,
    pub correct: bool,
    pub awarded: i64,
    pub marks: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeResult {
    pub score: i64,
    pub max_score: i64,
    pub percentage: f64,
    pub results: Vec<QuestionResult>,
}

/// Checks a question definition and returns the normalized options and answer.
pub fn validate_question(
    kind: QuestionKind,
    options: &[String],
    correct_answer: &str,
    marks: i64,
) -> Result<(Vec<String>, String), String> {
    if marks <= 0 {
        return Err("marks must be greater than zero".to_string());
    }

    let answer = correct_answer.trim();
    match kind {
        QuestionKind::Mcq => {
            let options: Vec<String> = options
                .iter()
                .map(|option| option.trim().to_string())
                .filter(|option| !option.is_empty())
                .collect();
            if options.len() < 2 {
                return Err("multiple-choice questions need at least two options".to_string());
            }
            let mut unique = options.clone();
            unique.sort();
            unique.dedup();
            if unique.len() != options.len() {
                return Err("options must be distinct".to_string());
            }
            if !options.iter().any(|option| option == answer) {
                return Err("correct answer must be one of the options".to_string());
            }
            Ok((options, answer.to_string()))
        }
        QuestionKind::TrueFalse => match parse_bool(answer) {
            Some(value) => Ok((
                vec!["true".to_string(), "false".to_string()],
                value.to_string(),
            )),
            None => Err("true/false questions need an answer of true or false".to_string()),
        },
        QuestionKind::Short => {
            if answer.is_empty() {
                return Err("short-answer questions need a non-empty answer".to_string());
            }
            Ok((Vec::new(), answer.to_string()))
        }
    }
}

/// Scores answers keyed by question id. Missing or malformed answers earn nothing.
pub fn grade(questions: &[Question], answers: &HashMap<String, serde_json::Value>) -> GradeResult {
    let mut score = 0;
    let mut max_score = 0;
    let mut results = Vec::with_capacity(questions.len());

    for question in questions {
        max_score += question.marks;
        let correct = match (answers.get(&question.id).and_then(answer_text), &question.correct_answer) {
            (Some(given), Some(expected)) => is_correct(question.kind, &given, expected),
            _ => false,
        };
        let awarded = if correct { question.marks } else { 0 };
        score += awarded;
        results.push(QuestionResult {
            question_id: question.id.clone(),
            correct,
            awarded,
            marks: question.marks,
        });
    }

    GradeResult {
        score,
        max_score,
        percentage: percentage(score, max_score),
        results,
    }
}

pub fn percentage(score: i64, max_score: i64) -> f64 {
    if max_score <= 0 {
        return 0.0;
    }
    ((score as f64 / max_score as f64) * 10_000.0).round() / 100.0
}

fn is_correct(kind: QuestionKind, given: &str, expected: &str) -> bool {
    match kind {
        QuestionKind::Mcq => given.trim() == expected.trim(),
        QuestionKind::TrueFalse => parse_bool(given).is_some() && parse_bool(given) == parse_bool(expected),
        QuestionKind::Short => normalize_text(given) == normalize_text(expected),
    }
}

fn answer_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn normalize_text(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::operations::questions::Difficulty;
    use serde_json::json;

    fn question(id: &str, kind: QuestionKind, answer: &str, marks: i64) -> Question {
        Question {
            id: id.to_string(),
            module_id: "m".to_string(),
            prompt: "?".to_string(),
            kind,
            options: Vec::new(),
            correct_answer: Some(answer.to_string()),
            marks,
            difficulty: Difficulty::Medium,
            created_by: "t".to_string(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn grades_each_kind() {
        let questions = vec![
            question("q1", QuestionKind::Mcq, "Paris", 2),
            question("q2", QuestionKind::TrueFalse, "true", 1),
            question("q3", QuestionKind::Short, "Binary  Search", 3),
            question("q4", QuestionKind::Mcq, "4", 4),
        ];
        let answers: HashMap<String, serde_json::Value> = [
            ("q1".to_string(), json!("Paris")),
            ("q2".to_string(), json!(true)),
            ("q3".to_string(), json!("  binary search ")),
        ]
        .into_iter()
        .collect();

        let result = grade(&questions, &answers);
        assert_eq!(result.score, 6);
        assert_eq!(result.max_score, 10);
        assert_eq!(result.percentage, 60.0);
        assert!(!result.results[3].correct);
        assert_eq!(result.results[3].awarded, 0);
    }

    #[test]
    fn numeric_answers_match_mcq_text() {
        let questions = vec![question("q", QuestionKind::Mcq, "4", 1)];
        let answers: HashMap<String, serde_json::Value> =
            [("q".to_string(), json!(4))].into_iter().collect();
        assert_eq!(grade(&questions, &answers).score, 1);
    }

    #[test]
    fn empty_assessment_scores_zero_percent() {
        let result = grade(&[], &HashMap::new());
        assert_eq!(result.max_score, 0);
        assert_eq!(result.percentage, 0.0);
    }

    #[test]
    fn percentage_rounds_to_two_places() {
        assert_eq!(percentage(1, 3), 33.33);
        assert_eq!(percentage(2, 3), 66.67);
        assert_eq!(percentage(3, 3), 100.0);
    }

    #[test]
    fn validates_question_definitions() {
        let options = vec!["a".to_string(), " b ".to_string()];
        assert_eq!(
            validate_question(QuestionKind::Mcq, &options, "b", 1).unwrap(),
            (vec!["a".to_string(), "b".to_string()], "b".to_string())
        );
        assert!(validate_question(QuestionKind::Mcq, &options, "c", 1).is_err());
        assert!(validate_question(QuestionKind::Mcq, &["a".to_string()], "a", 1).is_err());
        assert!(validate_question(QuestionKind::Mcq, &["a".to_string(), "a".to_string()], "a", 1).is_err());
        assert_eq!(
            validate_question(QuestionKind::TrueFalse, &[], "FALSE", 1).unwrap().1,
            "false"
        );
        assert!(validate_question(QuestionKind::TrueFalse, &[], "maybe", 1).is_err());
        assert!(validate_question(QuestionKind::Short, &[], "  ", 1).is_err());
        assert!(validate_question(QuestionKind::Short, &[], "x", 0).is_err());
    }
}
