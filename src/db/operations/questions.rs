use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use crate::db::{now_ms, serialize_ms, DatabaseProxy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionKind {
    Mcq,
    TrueFalse,
    Short,
}

impl QuestionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionKind::Mcq => "MCQ",
            QuestionKind::TrueFalse => "TRUE_FALSE",
            QuestionKind::Short => "SHORT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "MCQ" => Some(QuestionKind::Mcq),
            "TRUE_FALSE" => Some(QuestionKind::TrueFalse),
            "SHORT" => Some(QuestionKind::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "EASY",
            Difficulty::Medium => "MEDIUM",
            Difficulty::Hard => "HARD",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "EASY" => Some(Difficulty::Easy),
            "MEDIUM" => Some(Difficulty::Medium),
            "HARD" => Some(Difficulty::Hard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub module_id: String,
    pub prompt: String,
    pub kind: QuestionKind,
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<String>,
    pub marks: i64,
    pub difficulty: Difficulty,
    pub created_by: String,
    #[serde(serialize_with = "serialize_ms")]
    pub created_at: i64,
    #[serde(serialize_with = "serialize_ms")]
    pub updated_at: i64,
}

impl Question {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let difficulty: String = row.try_get("difficulty")?;
        let options: String = row.try_get("options")?;
        Ok(Self {
            id: row.try_get("id")?,
            module_id: row.try_get("moduleId")?,
            prompt: row.try_get("prompt")?,
            kind: QuestionKind::parse(&kind)
                .ok_or_else(|| sqlx::Error::Decode(format!("unknown question kind {kind}").into()))?,
            options: serde_json::from_str(&options).unwrap_or_default(),
            correct_answer: Some(row.try_get("correctAnswer")?),
            marks: row.try_get("marks")?,
            difficulty: Difficulty::parse(&difficulty).unwrap_or(Difficulty::Medium),
            created_by: row.try_get("createdBy")?,
            created_at: row.try_get("createdAt")?,
            updated_at: row.try_get("updatedAt")?,
        })
    }

    /// Copy safe to show a student.
    pub fn without_answer(mut self) -> Self {
        self.correct_answer = None;
        self
    }
}

#[derive(Debug, Clone)]
pub struct NewQuestion {
    pub module_id: String,
    pub prompt: String,
    pub kind: QuestionKind,
    pub options: Vec<String>,
    pub correct_answer: String,
    pub marks: i64,
    pub difficulty: Difficulty,
    pub created_by: String,
}

#[derive(Debug, Clone)]
pub struct QuestionUpdate {
    pub prompt: String,
    pub kind: QuestionKind,
    pub options: Vec<String>,
    pub correct_answer: String,
    pub marks: i64,
    pub difficulty: Difficulty,
}

pub async fn insert_question(proxy: &DatabaseProxy, question: NewQuestion) -> Result<Question, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    let now = now_ms();
    sqlx::query(
        r#"
        INSERT INTO "questions" (
            "id", "moduleId", "prompt", "kind", "options", "correctAnswer",
            "marks", "difficulty", "createdBy", "createdAt", "updatedAt"
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&question.module_id)
    .bind(question.prompt.trim())
    .bind(question.kind.as_str())
    .bind(serde_json::to_string(&question.options).unwrap_or_else(|_| "[]".to_string()))
    .bind(&question.correct_answer)
    .bind(question.marks)
    .bind(question.difficulty.as_str())
    .bind(&question.created_by)
    .bind(now)
    .bind(now)
    .execute(proxy.pool())
    .await?;

    find_question(proxy, &id).await?.ok_or(sqlx::Error::RowNotFound)
}

pub async fn find_question(proxy: &DatabaseProxy, id: &str) -> Result<Option<Question>, sqlx::Error> {
    let row = sqlx::query(r#"SELECT * FROM "questions" WHERE "id" = ?"#)
        .bind(id)
        .fetch_optional(proxy.pool())
        .await?;
    row.as_ref().map(Question::from_row).transpose()
}

pub async fn questions_for_module(
    proxy: &DatabaseProxy,
    module_id: &str,
) -> Result<Vec<Question>, sqlx::Error> {
    let rows = sqlx::query(r#"SELECT * FROM "questions" WHERE "moduleId" = ? ORDER BY "createdAt", "id""#)
        .bind(module_id)
        .fetch_all(proxy.pool())
        .await?;
    rows.iter().map(Question::from_row).collect()
}

/// Questions in the order given by `ids`; unknown ids are skipped.
pub async fn questions_by_ids(
    proxy: &DatabaseProxy,
    ids: &[String],
) -> Result<Vec<Question>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(r#"SELECT * FROM "questions" WHERE "id" IN ("#);
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");
    let rows = builder.build().fetch_all(proxy.pool()).await?;
    let mut questions = rows
        .iter()
        .map(Question::from_row)
        .collect::<Result<Vec<_>, _>>()?;
    questions.sort_by_key(|q| ids.iter().position(|id| *id == q.id).unwrap_or(usize::MAX));
    Ok(questions)
}

pub async fn update_question(
    proxy: &DatabaseProxy,
    id: &str,
    update: QuestionUpdate,
) -> Result<Option<Question>, sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE "questions"
        SET "prompt" = ?, "kind" = ?, "options" = ?, "correctAnswer" = ?,
            "marks" = ?, "difficulty" = ?, "updatedAt" = ?
        WHERE "id" = ?
        "#,
    )
    .bind(update.prompt.trim())
    .bind(update.kind.as_str())
    .bind(serde_json::to_string(&update.options).unwrap_or_else(|_| "[]".to_string()))
    .bind(&update.correct_answer)
    .bind(update.marks)
    .bind(update.difficulty.as_str())
    .bind(now_ms())
    .bind(id)
    .execute(proxy.pool())
    .await?;

    find_question(proxy, id).await
}

pub async fn delete_question(proxy: &DatabaseProxy, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(r#"DELETE FROM "questions" WHERE "id" = ?"#)
        .bind(id)
        .execute(proxy.pool())
        .await?;
    Ok(result.rows_affected() > 0)
}
