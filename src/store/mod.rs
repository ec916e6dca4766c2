// src/store/mod.rs

//! Persistence boundary of the grading engine.
//!
//! "At most one inprogress attempt per (user, question paper)" is enforced here,
//! by `get_or_create_inprogress`, and not by any in-process lock.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::AppError,
    models::{
        answer_paper::{
            Answer, AnswerGrade, AnswerPaper, AssignmentUpload, NewAnswer, NewAnswerPaper,
            PaperScore, PaperStatus,
        },
        question::{CreateQuestionRequest, Question, TestCase, TestCaseKind},
        quiz::{CreatePaperRequest, CreateQuizRequest, QuestionPaper, Quiz},
    },
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Whether a learner has finished, and passed, some attempt of a quiz.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrerequisiteStatus {
    pub completed: bool,
    pub passed: bool,
}

/// Timing columns of an attempt, rewritten when staff grant extra time.
#[derive(Debug, Clone, Copy)]
pub struct PaperWindow {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub extra_time: f64,
    pub status: PaperStatus,
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn create_question(&self, req: &CreateQuestionRequest) -> Result<Question, AppError>;

    async fn get_question(&self, id: i64) -> Result<Option<Question>, AppError>;

    /// Unknown ids are silently skipped.
    async fn get_questions(&self, ids: &[i64]) -> Result<Vec<Question>, AppError>;

    async fn add_test_case(&self, question_id: i64, data: TestCaseKind) -> Result<TestCase, AppError>;

    /// Test cases of a question in authoring (id) order.
    async fn get_test_cases(&self, question_id: i64) -> Result<Vec<TestCase>, AppError>;

    async fn create_quiz(&self, req: &CreateQuizRequest) -> Result<Quiz, AppError>;

    async fn get_quiz(&self, id: i64) -> Result<Option<Quiz>, AppError>;

    async fn create_question_paper(&self, req: &CreatePaperRequest) -> Result<QuestionPaper, AppError>;

    /// Loads the paper together with its question sets.
    async fn get_question_paper(&self, id: i64) -> Result<Option<QuestionPaper>, AppError>;

    async fn set_total_marks(&self, question_paper_id: i64, total_marks: f64) -> Result<(), AppError>;

    /// Every attempt of a learner at a paper, by attempt number.
    async fn list_attempts(&self, user_id: i64, question_paper_id: i64) -> Result<Vec<AnswerPaper>, AppError>;

    async fn get_answer_paper(&self, id: i64) -> Result<Option<AnswerPaper>, AppError>;

    /// Atomically inserts a new inprogress attempt, or returns the inprogress
    /// attempt that already exists for (user, question paper). The flag is
    /// `true` only when this call created the row.
    async fn get_or_create_inprogress(&self, new: NewAnswerPaper) -> Result<(AnswerPaper, bool), AppError>;

    /// Adds `question_id` to the answered set once.
    async fn mark_answered(&self, paper_id: i64, question_id: i64) -> Result<AnswerPaper, AppError>;

    /// Writes status and aggregates. A completed paper keeps its status; only
    /// `update_paper_window` may reopen it.
    async fn update_paper_scores(
        &self,
        paper_id: i64,
        status: PaperStatus,
        score: PaperScore,
        end_time: DateTime<Utc>,
    ) -> Result<AnswerPaper, AppError>;

    async fn update_paper_window(&self, paper_id: i64, window: PaperWindow) -> Result<AnswerPaper, AppError>;

    async fn prerequisite_status(&self, user_id: i64, quiz_id: i64) -> Result<PrerequisiteStatus, AppError>;

    async fn insert_answer(&self, new: NewAnswer) -> Result<Answer, AppError>;

    /// Answer history of a paper in insertion order.
    async fn list_answers(&self, paper_id: i64) -> Result<Vec<Answer>, AppError>;

    async fn set_correlation_id(&self, answer_id: i64, correlation_id: &str) -> Result<(), AppError>;

    /// Writes grading columns only if the row still carries `correlation_id`
    /// and, with `live_only`, its paper is still inprogress. Returns `false`
    /// when the result was superseded or the paper closed.
    async fn apply_grade(
        &self,
        answer_id: i64,
        correlation_id: Option<&str>,
        grade: &AnswerGrade,
        live_only: bool,
    ) -> Result<bool, AppError>;

    async fn set_answer_marks(&self, answer_id: i64, marks: f64, comment: Option<String>) -> Result<(), AppError>;

    /// Persists `candidate` as the option order unless one is already stored,
    /// and returns the stored order.
    async fn ensure_option_order(
        &self,
        paper_id: i64,
        question_id: i64,
        candidate: &[i64],
    ) -> Result<Vec<i64>, AppError>;

    /// Inserts or replaces the upload for (user, question, question paper).
    async fn save_upload(&self, upload: AssignmentUpload) -> Result<(), AppError>;

    async fn get_upload(
        &self,
        user_id: i64,
        question_id: i64,
        question_paper_id: i64,
    ) -> Result<Option<AssignmentUpload>, AppError>;
}
