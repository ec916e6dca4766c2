// src/models/quiz.rs

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// Represents the 'quizzes' table: the examination event a paper belongs to.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Quiz {
    pub id: i64,
    pub description: String,
    pub start_date_time: DateTime<Utc>,
    pub end_date_time: DateTime<Utc>,

    /// Always in minutes.
    pub duration_minutes: i32,

    pub active: bool,

    /// Minimum passing percentage.
    pub pass_criteria: f64,

    /// `-1` means unlimited.
    pub attempts_allowed: i32,

    /// Cooldown between attempt starts, in hours.
    pub time_between_attempts: f64,

    pub allow_skip: bool,

    /// Quiz that must be completed before this one may be started.
    pub prerequisite_quiz_id: Option<i64>,

    /// When set, the prerequisite must also have been passed.
    pub prerequisite_requires_pass: bool,
}

impl Quiz {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !(self.start_date_time <= now && now < self.end_date_time)
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(i64::from(self.duration_minutes))
    }

    /// `None` when the cooldown is too long to represent.
    pub fn cooldown(&self) -> Option<Duration> {
        let seconds = (self.time_between_attempts * 3600.0).round();
        if !seconds.is_finite() || seconds < 0.0 || seconds >= i64::MAX as f64 {
            return None;
        }
        Duration::try_seconds(seconds as i64)
    }

    /// Earliest start of the attempt following one started at `last_start`.
    /// An unrepresentable cooldown never elapses.
    pub fn next_attempt_at(&self, last_start: DateTime<Utc>) -> DateTime<Utc> {
        self.cooldown()
            .and_then(|cooldown| last_start.checked_add_signed(cooldown))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn has_unlimited_attempts(&self) -> bool {
        self.attempts_allowed == -1
    }
}

/// A pool of interchangeable questions; `num_questions` are drawn per attempt.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QuestionSet {
    pub id: i64,
    pub question_paper_id: i64,

    /// Marks for each question drawn from this pool.
    pub marks: f64,

    pub num_questions: i32,

    /// Pool members, in insertion order.
    pub questions: Vec<i64>,
}

/// Represents the 'question_papers' table: the template an answer paper is built from.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QuestionPaper {
    pub id: i64,
    pub quiz_id: i64,

    /// Mandatory questions, in insertion order.
    pub fixed_questions: Vec<i64>,

    /// Explicit presentation order for the fixed questions, if one was recorded.
    pub fixed_question_order: Option<Vec<i64>>,

    pub shuffle_questions: bool,

    /// Randomize mcq/mcc option order for each attempt.
    pub shuffle_testcases: bool,

    /// Derived; refreshed only through `update_total_marks`.
    pub total_marks: f64,

    #[sqlx(skip)]
    #[serde(default)]
    pub question_sets: Vec<QuestionSet>,
}

impl QuestionPaper {
    pub fn has_questions(&self) -> bool {
        !self.fixed_questions.is_empty() || !self.question_sets.is_empty()
    }
}

/// DTO for creating a quiz.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateQuizRequest {
    #[validate(length(min = 1, max = 256))]
    pub description: String,
    pub start_date_time: Option<DateTime<Utc>>,
    pub end_date_time: Option<DateTime<Utc>>,
    #[validate(range(min = 1))]
    pub duration_minutes: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[validate(range(min = 0.0, max = 100.0))]
    #[serde(default = "default_pass_criteria")]
    pub pass_criteria: f64,
    #[validate(range(min = -1))]
    #[serde(default = "default_attempts")]
    pub attempts_allowed: i32,
    /// At most ten years.
    #[validate(range(min = 0.0, max = 87600.0))]
    #[serde(default)]
    pub time_between_attempts: f64,
    #[serde(default = "default_true")]
    pub allow_skip: bool,
    pub prerequisite_quiz_id: Option<i64>,
    #[serde(default)]
    pub prerequisite_requires_pass: bool,
}

/// DTO for one random pool inside a new paper.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateQuestionSetRequest {
    #[validate(range(min = 0.0))]
    pub marks: f64,
    #[validate(range(min = 1))]
    pub num_questions: i32,
    #[validate(length(min = 1))]
    pub questions: Vec<i64>,
}

/// DTO for creating a question paper.
#[derive(Debug, Deserialize, Validate)]
pub struct CreatePaperRequest {
    pub quiz_id: i64,
    #[serde(default)]
    pub fixed_questions: Vec<i64>,
    pub fixed_question_order: Option<Vec<i64>>,
    #[serde(default)]
    pub shuffle_questions: bool,
    #[serde(default = "default_true")]
    pub shuffle_testcases: bool,
    #[validate(nested)]
    #[serde(default)]
    pub question_sets: Vec<CreateQuestionSetRequest>,
}

fn default_true() -> bool {
    true
}

fn default_pass_criteria() -> f64 {
    40.0
}

fn default_attempts() -> i32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiz(time_between_attempts: f64) -> Quiz {
        let now = Utc::now();
        Quiz {
            id: 1,
            description: "quiz".into(),
            start_date_time: now,
            end_date_time: now + Duration::days(1),
            duration_minutes: 30,
            active: true,
            pass_criteria: 40.0,
            attempts_allowed: -1,
            time_between_attempts,
            allow_skip: true,
            prerequisite_quiz_id: None,
            prerequisite_requires_pass: false,
        }
    }

    #[test]
    fn next_attempt_waits_for_the_cooldown() {
        let start = Utc::now();
        assert_eq!(quiz(1.5).next_attempt_at(start), start + Duration::minutes(90));
        assert_eq!(quiz(0.0).next_attempt_at(start), start);
    }

    #[test]
    fn oversized_cooldown_never_elapses() {
        let start = Utc::now();
        assert_eq!(quiz(1e12).cooldown(), None);
        assert_eq!(quiz(1e12).next_attempt_at(start), DateTime::<Utc>::MAX_UTC);
        assert_eq!(quiz(80_000.0).next_attempt_at(DateTime::<Utc>::MAX_UTC), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn cooldown_is_bounded_when_authoring() {
        let req: CreateQuizRequest = serde_json::from_value(serde_json::json!({
            "description": "Endless",
            "duration_minutes": 10,
            "time_between_attempts": 1e12
        }))
        .unwrap();
        assert!(req.validate().is_err());
    }
}
