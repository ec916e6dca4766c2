// src/engine/scoring.rs

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{QuizEngine, validator};
use crate::{
    error::AppError,
    models::{
        answer_paper::{AnswerGrade, AnswerLog, AnswerPaper, PaperScore, PaperStatus, QuestionSummary},
        question::QuestionKind,
    },
};

/// Outcome of re-grading one answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegradeResult {
    pub changed: bool,
    pub marks: f64,
    pub detail: Vec<String>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Aggregates for a paper. Percent and pass are undefined while the paper
/// has no marks to give.
pub fn compute_score(marks_obtained: f64, total_marks: f64, pass_criteria: f64) -> PaperScore {
    if total_marks <= 0.0 {
        return PaperScore {
            marks_obtained,
            percent: None,
            passed: None,
        };
    }
    let percent = round2(marks_obtained / total_marks * 100.0);
    PaperScore {
        marks_obtained,
        percent: Some(percent),
        passed: Some(percent >= pass_criteria),
    }
}

/// Σ marks of the latest answer per question on the paper.
pub fn latest_marks(paper: &AnswerPaper, log: &AnswerLog) -> f64 {
    paper
        .questions_order
        .iter()
        .filter_map(|id| log.current(*id))
        .map(|answer| answer.marks)
        .sum()
}

impl QuizEngine {
    /// Sets the paper status and recomputes its aggregates from the latest
    /// answer of every question. A completed paper stays completed.
    pub async fn update_marks(&self, paper_id: i64, status: PaperStatus) -> Result<AnswerPaper, AppError> {
        let attempt = self.load_attempt(paper_id).await?;
        let log = AnswerLog::new(self.store.list_answers(paper_id).await?);

        let score = compute_score(
            latest_marks(&attempt.paper, &log),
            attempt.question_paper.total_marks,
            attempt.quiz.pass_criteria,
        );
        let end_time = match status {
            PaperStatus::Completed => attempt.paper.end_time.min(self.now()),
            PaperStatus::InProgress => attempt.paper.end_time,
        };

        self.store
            .update_paper_scores(paper_id, status, score, end_time)
            .await
    }

    /// Recomputes aggregates without touching the status.
    pub(crate) async fn rescore(&self, paper_id: i64) -> Result<AnswerPaper, AppError> {
        let paper = self
            .store
            .get_answer_paper(paper_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Answer paper {} not found", paper_id)))?;
        self.update_marks(paper_id, paper.status).await
    }

    /// Closes the attempt and returns its score. Repeated calls return the
    /// stored score.
    pub async fn finalize(&self, paper_id: i64) -> Result<PaperScore, AppError> {
        let paper = self
            .store
            .get_answer_paper(paper_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Answer paper {} not found", paper_id)))?;

        if !paper.is_inprogress() {
            return Ok(score_of(&paper));
        }

        self.dispatcher.waits().cancel(paper_id);
        let paper = self.update_marks(paper_id, PaperStatus::Completed).await?;

        tracing::info!(
            "Paper {} completed with {} marks ({:?}%)",
            paper_id,
            paper.marks_obtained,
            paper.percent
        );
        Ok(score_of(&paper))
    }

    /// Re-runs grading for the latest answer to `question_id` and rescales
    /// the paper. Other questions are left alone and the attempt's status and
    /// times are kept.
    pub async fn regrade(&self, paper_id: i64, question_id: i64) -> Result<RegradeResult, AppError> {
        let attempt = self.load_attempt(paper_id).await?;
        let question = self.question_in(&attempt, question_id).await?;

        let log = AnswerLog::new(self.store.list_answers(paper_id).await?);
        let Some(answer) = log.current(question_id).cloned() else {
            return Ok(RegradeResult {
                changed: false,
                marks: 0.0,
                detail: vec!["Did not answer".to_string()],
            });
        };

        if question.kind == QuestionKind::Upload {
            return Ok(RegradeResult {
                changed: false,
                marks: answer.marks,
                detail: vec!["Uploads are graded manually".to_string()],
            });
        }

        let test_cases = self.store.get_test_cases(question_id).await?;
        let check = validator::check(&question, &test_cases, &answer.answer.0)?;

        let remaining = self.time_left_of(&attempt);
        let budget = if attempt.paper.is_inprogress() && !remaining.is_zero() {
            remaining
        } else {
            self.regrade_timeout
        };

        // Regrade waits are not tied to the attempt: finalizing must not cancel them.
        let resolution = self
            .resolve(&attempt, &question, &answer, check, budget, &CancellationToken::new())
            .await?;

        if !resolution.settled {
            tracing::warn!(
                "Regrade of paper {} question {} got no result; keeping {} marks",
                paper_id,
                question_id,
                answer.marks
            );
            return Ok(RegradeResult {
                changed: false,
                marks: answer.marks,
                detail: resolution.verdict.detail,
            });
        }

        let grade = resolution.verdict.to_grade();
        let previous = AnswerGrade {
            correct: answer.correct,
            marks: answer.marks,
            error: answer.error.0.clone(),
        };
        let applied = self
            .store
            .apply_grade(answer.id, resolution.correlation_id.as_deref(), &grade, false)
            .await?;
        if !applied {
            tracing::warn!("Regrade of answer {} was superseded by a newer dispatch", answer.id);
            return Ok(RegradeResult {
                changed: false,
                marks: answer.marks,
                detail: resolution.verdict.detail,
            });
        }

        self.rescore(paper_id).await?;

        tracing::info!(
            "Regraded paper {} question {}: {} -> {} marks",
            paper_id,
            question_id,
            previous.marks,
            grade.marks
        );

        Ok(RegradeResult {
            changed: grade != previous,
            marks: grade.marks,
            detail: resolution.verdict.detail,
        })
    }

    /// Manual grading: overwrites the marks of the latest answer, capped at
    /// the question's points.
    pub async fn set_marks(
        &self,
        paper_id: i64,
        question_id: i64,
        marks: f64,
        comment: Option<String>,
    ) -> Result<AnswerPaper, AppError> {
        let attempt = self.load_attempt(paper_id).await?;
        let question = self.question_in(&attempt, question_id).await?;

        let log = AnswerLog::new(self.store.list_answers(paper_id).await?);
        let answer = log.current(question_id).ok_or_else(|| {
            AppError::NotFound(format!("No answer to question {} on paper {}", question_id, paper_id))
        })?;

        let marks = marks.clamp(0.0, question.points);
        self.store.set_answer_marks(answer.id, marks, comment).await?;
        tracing::info!("Set marks of paper {} question {} to {}", paper_id, question_id, marks);

        self.rescore(paper_id).await
    }

    /// Per-question view of a paper, in delivery order.
    pub async fn answer_summary(&self, paper_id: i64) -> Result<Vec<QuestionSummary>, AppError> {
        let attempt = self.load_attempt(paper_id).await?;
        let log = AnswerLog::new(self.store.list_answers(paper_id).await?);

        Ok(attempt
            .paper
            .questions_order
            .iter()
            .map(|id| {
                let latest = log.current(*id).cloned();
                QuestionSummary {
                    question_id: *id,
                    answered: attempt.paper.is_answered(*id),
                    attempts: log.history(*id).len(),
                    marks: latest.as_ref().map_or(0.0, |a| a.marks),
                    latest,
                }
            })
            .collect())
    }
}

fn score_of(paper: &AnswerPaper) -> PaperScore {
    PaperScore {
        marks_obtained: paper.marks_obtained,
        percent: paper.percent,
        passed: paper.passed,
    }
}
