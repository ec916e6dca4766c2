// src/models/question.rs

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::Json};
use validator::Validate;

use crate::models::UnknownVariant;

/// The closed set of question kinds the engine knows how to grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionKind {
    Mcq,
    Mcc,
    Code,
    Integer,
    Float,
    String,
    Arrange,
    Upload,
}

impl QuestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionKind::Mcq => "mcq",
            QuestionKind::Mcc => "mcc",
            QuestionKind::Code => "code",
            QuestionKind::Integer => "integer",
            QuestionKind::Float => "float",
            QuestionKind::String => "string",
            QuestionKind::Arrange => "arrange",
            QuestionKind::Upload => "upload",
        }
    }

    /// Kinds whose option order is randomized per attempt.
    pub fn has_option_order(&self) -> bool {
        matches!(
            self,
            QuestionKind::Mcq | QuestionKind::Mcc | QuestionKind::Arrange
        )
    }
}

impl fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for QuestionKind {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "mcq" => Ok(QuestionKind::Mcq),
            "mcc" => Ok(QuestionKind::Mcc),
            "code" => Ok(QuestionKind::Code),
            "integer" => Ok(QuestionKind::Integer),
            "float" => Ok(QuestionKind::Float),
            "string" => Ok(QuestionKind::String),
            "arrange" => Ok(QuestionKind::Arrange),
            "upload" => Ok(QuestionKind::Upload),
            _ => Err(UnknownVariant::new("question kind", value)),
        }
    }
}

/// Positional and keyword arguments forwarded to the code runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunArgs {
    #[serde(default)]
    pub positional: Vec<serde_json::Value>,
    #[serde(default)]
    pub keyword: serde_json::Map<String, serde_json::Value>,
}

/// Represents the 'questions' table in the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,

    /// One-line summary shown in listings.
    pub summary: String,

    pub description: String,

    /// Marks awarded for a correct answer.
    pub points: f64,

    /// Programming language for code questions; free text for the rest.
    pub language: String,

    /// Mapped from the database column 'type' since `type` is a reserved keyword in Rust.
    #[sqlx(rename = "type", try_from = "String")]
    #[serde(rename = "type")]
    pub kind: QuestionKind,

    /// Inactive questions are never drawn from a random pool.
    pub active: bool,

    /// Code questions only: award marks in proportion to passed test-case weight.
    pub partial_grading: bool,

    pub snippet: String,

    /// Path of the reference harness on the code runner, if any.
    pub ref_code_path: Option<String>,

    pub run_args: Json<RunArgs>,

    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// DTO for sending a question to a learner.
#[derive(Debug, Clone, Serialize)]
pub struct PublicQuestion {
    pub id: i64,
    pub summary: String,
    pub description: String,
    pub points: f64,
    pub language: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub snippet: String,

    /// Choices in the order this attempt presents them (mcq/mcc/arrange only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<QuestionOption>,
}

impl From<&Question> for PublicQuestion {
    fn from(q: &Question) -> Self {
        PublicQuestion {
            id: q.id,
            summary: q.summary.clone(),
            description: q.description.clone(),
            points: q.points,
            language: q.language.clone(),
            kind: q.kind,
            snippet: q.snippet.clone(),
            options: Vec::new(),
        }
    }
}

/// How string answers are compared against the expected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringCheck {
    Exact,
    Lower,
}

/// Per-kind test case payloads, stored as tagged JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "test_case_type", rename_all = "snake_case")]
pub enum TestCaseKind {
    /// Assertion code run against the submission.
    Standard {
        test_case: String,
        #[serde(default = "default_weight")]
        weight: f64,
        #[serde(default)]
        test_case_args: String,
        #[serde(default)]
        hidden: bool,
    },
    /// Feed `expected_input` on stdin and compare stdout.
    StdIo {
        #[serde(default)]
        expected_input: Option<String>,
        expected_output: String,
        #[serde(default = "default_weight")]
        weight: f64,
        #[serde(default)]
        hidden: bool,
    },
    /// Instructor-written checker invoked with the submission.
    Hook {
        hook_code: String,
        #[serde(default = "default_weight")]
        weight: f64,
        #[serde(default)]
        hidden: bool,
    },
    Mcq {
        options: String,
        #[serde(default)]
        correct: bool,
    },
    Integer {
        correct: i64,
    },
    Float {
        correct: f64,
        #[serde(default)]
        error_margin: f64,
    },
    String {
        correct: String,
        string_check: StringCheck,
    },
    Arrange {
        options: String,
    },
}

fn default_weight() -> f64 {
    1.0
}

impl TestCaseKind {
    /// Weight contributed towards partial grading; zero for non-code cases.
    pub fn weight(&self) -> f64 {
        match self {
            TestCaseKind::Standard { weight, .. }
            | TestCaseKind::StdIo { weight, .. }
            | TestCaseKind::Hook { weight, .. } => *weight,
            _ => 0.0,
        }
    }

    pub fn is_code_assertion(&self) -> bool {
        matches!(
            self,
            TestCaseKind::Standard { .. } | TestCaseKind::StdIo { .. } | TestCaseKind::Hook { .. }
        )
    }

    /// Whether this payload may be attached to a question of `kind`.
    pub fn fits(&self, kind: QuestionKind) -> bool {
        match kind {
            QuestionKind::Code | QuestionKind::Upload => self.is_code_assertion(),
            QuestionKind::Mcq | QuestionKind::Mcc => matches!(self, TestCaseKind::Mcq { .. }),
            QuestionKind::Integer => matches!(self, TestCaseKind::Integer { .. }),
            QuestionKind::Float => matches!(self, TestCaseKind::Float { .. }),
            QuestionKind::String => matches!(self, TestCaseKind::String { .. }),
            QuestionKind::Arrange => matches!(self, TestCaseKind::Arrange { .. }),
        }
    }
}

/// Represents the 'test_cases' table in the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub question_id: i64,
    pub data: Json<TestCaseKind>,
}

/// A selectable option shown to the learner (mcq/mcc/arrange).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionOption {
    pub id: i64,
    pub text: String,
}

impl TestCase {
    pub fn as_option(&self) -> Option<QuestionOption> {
        match &self.data.0 {
            TestCaseKind::Mcq { options, .. } | TestCaseKind::Arrange { options } => {
                Some(QuestionOption {
                    id: self.id,
                    text: options.clone(),
                })
            }
            _ => None,
        }
    }
}

/// DTO for creating a new question.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateQuestionRequest {
    #[validate(length(min = 1, max = 256))]
    pub summary: String,
    #[validate(length(max = 10000))]
    pub description: String,
    #[validate(range(min = 0.0))]
    pub points: f64,
    #[validate(length(min = 1, max = 24))]
    pub language: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub partial_grading: bool,
    #[serde(default)]
    pub snippet: String,
    pub ref_code_path: Option<String>,
    #[serde(default)]
    pub run_args: RunArgs,
}

fn default_active() -> bool {
    true
}
