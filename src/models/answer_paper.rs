// src/models/answer_paper.rs

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};

use crate::models::UnknownVariant;

/// Lifecycle of an attempt. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperStatus {
    InProgress,
    Completed,
}

impl PaperStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaperStatus::InProgress => "inprogress",
            PaperStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for PaperStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for PaperStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "inprogress" => Ok(PaperStatus::InProgress),
            "completed" => Ok(PaperStatus::Completed),
            _ => Err(UnknownVariant::new("paper status", value)),
        }
    }
}

/// Represents the 'answer_papers' table: one learner's attempt at a question paper.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AnswerPaper {
    pub id: i64,
    pub user_id: i64,
    pub question_paper_id: i64,
    pub attempt_number: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    /// Delivery order, fixed when the paper is created.
    pub questions_order: Vec<i64>,

    /// Questions with an accepted answer, in the order they were accepted.
    pub questions_answered: Vec<i64>,

    #[sqlx(try_from = "String")]
    pub status: PaperStatus,

    pub marks_obtained: f64,

    /// `None` while the paper's total marks are zero.
    pub percent: Option<f64>,

    pub passed: Option<bool>,

    /// Additional minutes granted by staff.
    pub extra_time: f64,
}

impl AnswerPaper {
    pub fn is_inprogress(&self) -> bool {
        self.status == PaperStatus::InProgress
    }

    pub fn is_answered(&self, question_id: i64) -> bool {
        self.questions_answered.contains(&question_id)
    }

    pub fn contains_question(&self, question_id: i64) -> bool {
        self.questions_order.contains(&question_id)
    }

    pub fn questions_unanswered(&self) -> Vec<i64> {
        self.questions_order
            .iter()
            .copied()
            .filter(|id| !self.is_answered(*id))
            .collect()
    }

    pub fn questions_left(&self) -> usize {
        self.questions_unanswered().len()
    }
}

/// Values needed to insert a fresh attempt.
#[derive(Debug, Clone)]
pub struct NewAnswerPaper {
    pub user_id: i64,
    pub question_paper_id: i64,
    pub attempt_number: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub questions_order: Vec<i64>,
}

/// Aggregates written back by scoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PaperScore {
    pub marks_obtained: f64,
    pub percent: Option<f64>,
    pub passed: Option<bool>,
}

/// What the learner submitted, one variant per answer shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmittedValue {
    /// mcq: the chosen option id.
    Choice(i64),
    /// mcc: every chosen option id.
    Choices(Vec<i64>),
    Integer(i64),
    Float(f64),
    Text(String),
    /// arrange: option ids in the learner's order.
    Order(Vec<i64>),
    /// code: submitted source.
    Code(String),
    /// upload: stored file name.
    Upload(String),
}

/// Represents the 'answers' table. Rows are only ever appended; regrade and
/// manual marking rewrite the grading columns of the latest row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Answer {
    pub id: i64,
    pub answer_paper_id: i64,
    pub question_id: i64,
    pub answer: Json<SubmittedValue>,
    pub correct: bool,
    pub marks: f64,
    pub error: Json<Vec<String>>,
    pub skipped: bool,
    pub comment: Option<String>,

    /// Code runner correlation id of the last dispatch for this row.
    pub correlation_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Values needed to append an answer.
#[derive(Debug, Clone)]
pub struct NewAnswer {
    pub answer_paper_id: i64,
    pub question_id: i64,
    pub answer: SubmittedValue,
    pub skipped: bool,
    pub correlation_id: Option<String>,
}

/// Grading columns written onto an existing answer row.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerGrade {
    pub correct: bool,
    pub marks: f64,
    pub error: Vec<String>,
}

/// Ordered answer history of one paper, grouped per question.
///
/// The last entry of each history is the answer that counts.
#[derive(Debug, Default, Clone)]
pub struct AnswerLog {
    by_question: BTreeMap<i64, Vec<Answer>>,
}

impl AnswerLog {
    pub fn new(mut answers: Vec<Answer>) -> Self {
        answers.sort_by_key(|a| a.id);
        let mut by_question: BTreeMap<i64, Vec<Answer>> = BTreeMap::new();
        for answer in answers {
            by_question.entry(answer.question_id).or_default().push(answer);
        }
        Self { by_question }
    }

    pub fn current(&self, question_id: i64) -> Option<&Answer> {
        self.by_question.get(&question_id).and_then(|h| h.last())
    }

    pub fn history(&self, question_id: i64) -> &[Answer] {
        self.by_question
            .get(&question_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn has_correct(&self, question_id: i64) -> bool {
        self.history(question_id).iter().any(|a| a.correct)
    }
}

/// Per-question view of a paper for result pages.
#[derive(Debug, Serialize)]
pub struct QuestionSummary {
    pub question_id: i64,
    pub answered: bool,
    pub attempts: usize,
    pub latest: Option<Answer>,
    pub marks: f64,
}

/// Represents the 'assignment_uploads' table, keyed by (user, question, question paper).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AssignmentUpload {
    pub user_id: i64,
    pub question_id: i64,
    pub question_paper_id: i64,
    pub file_name: String,
    pub uploaded_at: DateTime<Utc>,
}
