// src/engine/sequencer.rs

use std::time::Duration;

use chrono::TimeDelta;

use super::{
    Attempt, NextQuestion, Outcome, QuizEngine, Refusal, StartOutcome, assembly,
};
use crate::{
    error::AppError,
    models::{
        answer_paper::{AnswerLog, AnswerPaper, NewAnswer, NewAnswerPaper, PaperStatus, SubmittedValue},
        question::{PublicQuestion, Question, QuestionKind, QuestionOption, TestCase},
    },
    store::PaperWindow,
};

/// Next unanswered question after `question_id` in cyclic order. The question
/// itself comes last, so a skipped question is offered again only when it is
/// the only one left.
pub fn next_unanswered_after(paper: &AnswerPaper, question_id: i64) -> Option<i64> {
    let order = &paper.questions_order;
    let start = order
        .iter()
        .position(|id| *id == question_id)
        .map_or(0, |pos| pos + 1);

    order
        .iter()
        .cycle()
        .skip(start)
        .take(order.len())
        .copied()
        .find(|id| !paper.is_answered(*id))
}

impl QuizEngine {
    /// Starts or resumes an attempt of `user_id` at a question paper.
    ///
    /// With `attempt_number` the caller names the attempt it expects; without
    /// it the live attempt is resumed or the next one is created.
    pub async fn start(
        &self,
        user_id: i64,
        question_paper_id: i64,
        attempt_number: Option<i32>,
    ) -> Result<StartOutcome, AppError> {
        let question_paper = self
            .store
            .get_question_paper(question_paper_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Question paper {} not found", question_paper_id))
            })?;
        let quiz = self
            .store
            .get_quiz(question_paper.quiz_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Quiz {} not found", question_paper.quiz_id)))?;

        let now = self.now();
        if !quiz.active || quiz.is_expired(now) {
            return Ok(StartOutcome::Refused(Refusal::QuizInactive));
        }

        let attempts = self.store.list_attempts(user_id, question_paper_id).await?;

        if let Some(number) = attempt_number {
            if let Some(existing) = attempts.iter().find(|p| p.attempt_number == number) {
                if !existing.is_inprogress() {
                    return Ok(StartOutcome::Refused(Refusal::AttemptCompleted {
                        attempt_number: number,
                    }));
                }
                let attempt = Attempt {
                    paper: existing.clone(),
                    question_paper: question_paper.clone(),
                    quiz: quiz.clone(),
                };
                if self.time_left_of(&attempt).is_zero() {
                    self.finalize(existing.id).await?;
                    return Ok(StartOutcome::Refused(Refusal::TimeExpired));
                }
                tracing::info!("User {} resumed answer paper {}", user_id, existing.id);
                return Ok(StartOutcome::Resumed(existing.clone()));
            }
        }

        if let Some(live) = attempts.iter().find(|p| p.is_inprogress()) {
            let attempt = Attempt {
                paper: live.clone(),
                question_paper: question_paper.clone(),
                quiz: quiz.clone(),
            };
            if !self.time_left_of(&attempt).is_zero() {
                tracing::info!("User {} resumed answer paper {}", user_id, live.id);
                return Ok(StartOutcome::Resumed(live.clone()));
            }
            self.finalize(live.id).await?;
        }

        if !question_paper.has_questions() {
            return Err(AppError::BadRequest(format!(
                "Question paper {} has no questions",
                question_paper_id
            )));
        }

        if let Some(prerequisite) = quiz.prerequisite_quiz_id {
            let status = self.store.prerequisite_status(user_id, prerequisite).await?;
            let met = if quiz.prerequisite_requires_pass {
                status.passed
            } else {
                status.completed
            };
            if !met {
                return Ok(StartOutcome::Refused(Refusal::PrerequisiteNotMet {
                    quiz_id: prerequisite,
                    requires_pass: quiz.prerequisite_requires_pass,
                }));
            }
        }

        if !quiz.has_unlimited_attempts() && attempts.len() >= quiz.attempts_allowed.max(0) as usize {
            return Ok(StartOutcome::Refused(Refusal::AttemptsExhausted {
                allowed: quiz.attempts_allowed,
            }));
        }

        if let Some(last) = attempts.iter().max_by_key(|p| p.start_time) {
            let available_at = quiz.next_attempt_at(last.start_time);
            if now < available_at {
                return Ok(StartOutcome::Refused(Refusal::CooldownActive { available_at }));
            }
        }

        let next_number = attempts.iter().map(|p| p.attempt_number).max().unwrap_or(0) + 1;
        if let Some(number) = attempt_number.filter(|n| *n != next_number) {
            return Err(AppError::BadRequest(format!(
                "Attempt {} cannot be started; the next attempt is {}",
                number, next_number
            )));
        }

        let questions_order = self.assemble(&question_paper).await?;
        let (paper, created) = self
            .store
            .get_or_create_inprogress(NewAnswerPaper {
                user_id,
                question_paper_id,
                attempt_number: next_number,
                start_time: now,
                end_time: now + quiz.duration(),
                questions_order,
            })
            .await?;

        if !created {
            tracing::info!("User {} lost a start race; resuming paper {}", user_id, paper.id);
            return Ok(StartOutcome::Resumed(paper));
        }

        for question in self.store.get_questions(&paper.questions_order).await? {
            if question.kind.has_option_order() {
                let test_cases = self.store.get_test_cases(question.id).await?;
                self.persisted_options(&paper, question_paper.shuffle_testcases, &question, &test_cases)
                    .await?;
            }
        }

        tracing::info!(
            "User {} started attempt {} of question paper {} (paper {})",
            user_id,
            paper.attempt_number,
            question_paper_id,
            paper.id
        );
        Ok(StartOutcome::Started(paper))
    }

    /// The question the learner should be looking at.
    pub async fn current_question(&self, paper_id: i64) -> Result<NextQuestion, AppError> {
        let attempt = match self.live_attempt(paper_id).await? {
            Ok(attempt) => attempt,
            Err(_) => return Ok(NextQuestion::AttemptClosed),
        };

        match attempt.paper.questions_unanswered().first() {
            Some(id) => self.deliver_id(&attempt, *id).await,
            None => Ok(NextQuestion::NoMoreQuestions),
        }
    }

    /// Moves past `question_id` without answering it. A code draft is kept as
    /// a skipped answer unless the question already has a correct one.
    pub async fn skip(
        &self,
        paper_id: i64,
        question_id: i64,
        draft: Option<String>,
    ) -> Result<Outcome<NextQuestion>, AppError> {
        let attempt = match self.live_attempt(paper_id).await? {
            Ok(attempt) => attempt,
            Err(refusal) => return Ok(Err(refusal)),
        };
        if !attempt.quiz.allow_skip {
            return Ok(Err(Refusal::SkipNotAllowed));
        }
        let question = self.question_in(&attempt, question_id).await?;

        if let Some(source) = draft.filter(|_| question.kind == QuestionKind::Code) {
            let log = AnswerLog::new(self.store.list_answers(paper_id).await?);
            if !log.has_correct(question_id) {
                self.store
                    .insert_answer(NewAnswer {
                        answer_paper_id: paper_id,
                        question_id,
                        answer: SubmittedValue::Code(source),
                        skipped: true,
                        correlation_id: None,
                    })
                    .await?;
                tracing::debug!("Saved skipped draft for paper {} question {}", paper_id, question_id);
            }
        }

        let next = match next_unanswered_after(&attempt.paper, question_id) {
            Some(id) => self.deliver_id(&attempt, id).await?,
            None => NextQuestion::NoMoreQuestions,
        };
        Ok(Ok(next))
    }

    /// Marks `question_id` answered (once) and returns what follows it.
    pub async fn add_completed_question(
        &self,
        paper_id: i64,
        question_id: i64,
    ) -> Result<NextQuestion, AppError> {
        let mut attempt = self.load_attempt(paper_id).await?;
        attempt.paper = self.store.mark_answered(paper_id, question_id).await?;

        match next_unanswered_after(&attempt.paper, question_id) {
            Some(id) => self.deliver_id(&attempt, id).await,
            None => Ok(NextQuestion::NoMoreQuestions),
        }
    }

    /// Remaining time of a paper; zero once the attempt has run out.
    pub async fn time_left(&self, paper_id: i64) -> Result<Duration, AppError> {
        let attempt = self.load_attempt(paper_id).await?;
        Ok(self.time_left_of(&attempt))
    }

    /// `duration + extra time - elapsed`, floored at zero.
    pub fn time_left_of(&self, attempt: &Attempt) -> Duration {
        let extra = TimeDelta::seconds((attempt.paper.extra_time * 60.0).round() as i64);
        let allowed = attempt.quiz.duration() + extra;
        let elapsed = self.now() - attempt.paper.start_time;
        (allowed - elapsed).to_std().unwrap_or_default()
    }

    /// Gives a learner `minutes` more. A paper that was closed by running out
    /// of time is reopened with a fresh window of exactly `minutes`.
    pub async fn grant_extra_time(&self, paper_id: i64, minutes: f64) -> Result<AnswerPaper, AppError> {
        if minutes.is_nan() || minutes <= 0.0 {
            return Err(AppError::BadRequest("Extra time must be positive".to_string()));
        }
        let attempt = self.load_attempt(paper_id).await?;
        let paper = &attempt.paper;
        let now = self.now();
        let added = TimeDelta::seconds((minutes * 60.0).round() as i64);

        let window = if paper.is_inprogress() {
            PaperWindow {
                start_time: paper.start_time,
                end_time: paper.end_time + added,
                extra_time: paper.extra_time + minutes,
                status: PaperStatus::InProgress,
            }
        } else if paper.end_time < now {
            PaperWindow {
                start_time: now - attempt.quiz.duration(),
                end_time: now + added,
                extra_time: minutes,
                status: PaperStatus::InProgress,
            }
        } else {
            PaperWindow {
                start_time: paper.start_time,
                end_time: paper.end_time,
                extra_time: paper.extra_time + minutes,
                status: paper.status,
            }
        };

        let updated = self.store.update_paper_window(paper_id, window).await?;
        tracing::info!(
            "Granted {} extra minutes to paper {} (status {})",
            minutes,
            paper_id,
            updated.status
        );
        Ok(updated)
    }

    /// Options of a question in the order this attempt presents them.
    pub async fn option_order(
        &self,
        paper_id: i64,
        question_id: i64,
    ) -> Result<Vec<QuestionOption>, AppError> {
        let attempt = self.load_attempt(paper_id).await?;
        let question = self.question_in(&attempt, question_id).await?;
        let test_cases = self.store.get_test_cases(question_id).await?;

        self.persisted_options(
            &attempt.paper,
            attempt.question_paper.shuffle_testcases,
            &question,
            &test_cases,
        )
        .await
    }

    /// Loads an attempt, closing it first when its time has run out.
    pub async fn refresh_attempt(&self, paper_id: i64) -> Result<Attempt, AppError> {
        let attempt = self.load_attempt(paper_id).await?;
        if attempt.paper.is_inprogress() && self.time_left_of(&attempt).is_zero() {
            tracing::info!("Paper {} ran out of time; finalizing", paper_id);
            self.finalize(paper_id).await?;
            return self.load_attempt(paper_id).await;
        }
        Ok(attempt)
    }

    /// Loads an attempt that still takes answers. An attempt whose time ran
    /// out is finalized here.
    pub(crate) async fn live_attempt(&self, paper_id: i64) -> Result<Outcome<Attempt>, AppError> {
        let attempt = self.load_attempt(paper_id).await?;
        if !attempt.paper.is_inprogress() {
            return Ok(Err(Refusal::AttemptCompleted {
                attempt_number: attempt.paper.attempt_number,
            }));
        }
        if self.time_left_of(&attempt).is_zero() {
            tracing::info!("Paper {} ran out of time; finalizing", paper_id);
            self.finalize(paper_id).await?;
            return Ok(Err(Refusal::TimeExpired));
        }
        Ok(Ok(attempt))
    }

    pub(crate) async fn question_in(
        &self,
        attempt: &Attempt,
        question_id: i64,
    ) -> Result<Question, AppError> {
        if !attempt.paper.contains_question(question_id) {
            return Err(AppError::BadRequest(format!(
                "Question {} is not part of paper {}",
                question_id, attempt.paper.id
            )));
        }
        self.store
            .get_question(question_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Question {} not found", question_id)))
    }

    async fn deliver_id(&self, attempt: &Attempt, question_id: i64) -> Result<NextQuestion, AppError> {
        let question = self
            .store
            .get_question(question_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Question {} not found", question_id)))?;
        self.deliver(attempt, &question).await
    }

    pub(crate) async fn deliver(
        &self,
        attempt: &Attempt,
        question: &Question,
    ) -> Result<NextQuestion, AppError> {
        let mut public = PublicQuestion::from(question);
        if question.kind.has_option_order() {
            let test_cases = self.store.get_test_cases(question.id).await?;
            public.options = self
                .persisted_options(
                    &attempt.paper,
                    attempt.question_paper.shuffle_testcases,
                    question,
                    &test_cases,
                )
                .await?;
        }
        Ok(NextQuestion::Question(public))
    }

    /// Stores a random option order on first use and replays it afterwards.
    async fn persisted_options(
        &self,
        paper: &AnswerPaper,
        shuffle_testcases: bool,
        question: &Question,
        test_cases: &[TestCase],
    ) -> Result<Vec<QuestionOption>, AppError> {
        let options: Vec<QuestionOption> = test_cases.iter().filter_map(TestCase::as_option).collect();

        let candidate = assembly::shuffled_options(
            question.kind,
            shuffle_testcases,
            test_cases,
            &mut rand::rng(),
        );
        let Some(candidate) = candidate else {
            return Ok(options);
        };

        let order = self
            .store
            .ensure_option_order(paper.id, question.id, &candidate)
            .await?;

        Ok(order
            .iter()
            .filter_map(|id| options.iter().find(|o| o.id == *id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn paper(order: Vec<i64>, answered: Vec<i64>) -> AnswerPaper {
        AnswerPaper {
            id: 1,
            user_id: 1,
            question_paper_id: 1,
            attempt_number: 1,
            start_time: Utc::now(),
            end_time: Utc::now(),
            questions_order: order,
            questions_answered: answered,
            status: PaperStatus::InProgress,
            marks_obtained: 0.0,
            percent: None,
            passed: None,
            extra_time: 0.0,
        }
    }

    #[test]
    fn skip_wraps_to_the_front() {
        let p = paper(vec![1, 2, 3, 4], vec![2]);
        assert_eq!(next_unanswered_after(&p, 1), Some(3));
        assert_eq!(next_unanswered_after(&p, 4), Some(1));
    }

    #[test]
    fn skipped_question_comes_back_last() {
        let p = paper(vec![1, 2, 3], vec![1, 3]);
        assert_eq!(next_unanswered_after(&p, 2), Some(2));
    }

    #[test]
    fn exhausted_paper_has_no_next_question() {
        let p = paper(vec![1, 2], vec![2, 1]);
        assert_eq!(next_unanswered_after(&p, 1), None);
    }

    #[test]
    fn unknown_question_starts_from_the_front() {
        let p = paper(vec![5, 6], vec![]);
        assert_eq!(next_unanswered_after(&p, 99), Some(5));
    }
}
