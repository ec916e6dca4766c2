// src/engine/mod.rs

//! Quiz attempt and grading engine.
//!
//! `QuizEngine` is the single entry point used by the HTTP layer. Its
//! operations are split across the submodules by concern; each one loads what
//! it needs from the `AttemptStore` and never holds state between calls, so
//! any number of engine instances may serve the same learners.

pub mod assembly;
pub mod clock;
pub mod dispatcher;
pub mod scoring;
pub mod sequencer;
pub mod validator;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::AppError,
    executor::CodeExecutor,
    models::{
        answer_paper::AnswerPaper,
        question::PublicQuestion,
        quiz::{QuestionPaper, Quiz},
    },
    store::AttemptStore,
};

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{GradingDispatcher, SubmitResult};
pub use scoring::RegradeResult;
pub use validator::Verdict;

/// Why the engine declined to act. Refusals are answers, not failures:
/// the caller decides what the learner sees.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Refusal {
    #[error("prerequisite quiz {quiz_id} has not been satisfied")]
    PrerequisiteNotMet { quiz_id: i64, requires_pass: bool },

    #[error("all {allowed} allowed attempts have been used")]
    AttemptsExhausted { allowed: i32 },

    #[error("the next attempt opens at {available_at}")]
    CooldownActive { available_at: DateTime<Utc> },

    #[error("this quiz is not open")]
    QuizInactive,

    #[error("time for this attempt is over")]
    TimeExpired,

    #[error("attempt {attempt_number} is already completed")]
    AttemptCompleted { attempt_number: i32 },

    #[error("questions cannot be skipped in this quiz")]
    SkipNotAllowed,
}

/// Result of an operation that may be refused.
pub type Outcome<T> = Result<T, Refusal>;

#[derive(Debug)]
pub enum StartOutcome {
    Started(AnswerPaper),
    Resumed(AnswerPaper),
    Refused(Refusal),
}

/// What the learner should see next.
///
/// `NoMoreQuestions` and `AttemptClosed` are distinct on purpose: the first
/// means every question has an accepted answer while time remains, the second
/// that the attempt no longer takes answers.
#[derive(Debug, Serialize)]
#[serde(tag = "status", content = "question", rename_all = "snake_case")]
pub enum NextQuestion {
    Question(PublicQuestion),
    NoMoreQuestions,
    AttemptClosed,
}

impl NextQuestion {
    pub fn question_id(&self) -> Option<i64> {
        match self {
            NextQuestion::Question(q) => Some(q.id),
            _ => None,
        }
    }
}

/// An answer paper together with the template and quiz it belongs to.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub paper: AnswerPaper,
    pub question_paper: QuestionPaper,
    pub quiz: Quiz,
}

pub struct QuizEngine {
    store: Arc<dyn AttemptStore>,
    dispatcher: GradingDispatcher,
    clock: Arc<dyn Clock>,

    /// Wait bound for a code regrade when the attempt has no time left.
    regrade_timeout: Duration,
}

impl QuizEngine {
    pub fn new(store: Arc<dyn AttemptStore>, executor: Arc<dyn CodeExecutor>) -> Self {
        Self {
            store,
            dispatcher: GradingDispatcher::new(executor, "output"),
            clock: Arc::new(SystemClock),
            regrade_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_regrade_timeout(mut self, timeout: Duration) -> Self {
        self.regrade_timeout = timeout;
        self
    }

    pub fn with_workdir_root(mut self, root: impl Into<String>) -> Self {
        self.dispatcher = self.dispatcher.with_workdir_root(root);
        self
    }

    pub fn store(&self) -> &Arc<dyn AttemptStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &GradingDispatcher {
        &self.dispatcher
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn load_attempt(&self, paper_id: i64) -> Result<Attempt, AppError> {
        let paper = self
            .store
            .get_answer_paper(paper_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Answer paper {} not found", paper_id)))?;

        let question_paper = self
            .store
            .get_question_paper(paper.question_paper_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Question paper {} not found", paper.question_paper_id))
            })?;

        let quiz = self
            .store
            .get_quiz(question_paper.quiz_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Quiz {} not found", question_paper.quiz_id)))?;

        Ok(Attempt {
            paper,
            question_paper,
            quiz,
        })
    }
}
