// src/engine/dispatcher.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    Attempt, NextQuestion, Outcome, QuizEngine, Refusal,
    validator::{self, CORRECT, Check, INCORRECT, Verdict},
};
use crate::{
    error::AppError,
    executor::{CodeExecutor, ExecutionResult, ExecutorError, JobPayload, JobStatus},
    models::{
        answer_paper::{Answer, AssignmentUpload, NewAnswer, SubmittedValue},
        question::{Question, QuestionKind},
    },
};

/// Pause between status polls when a blocking fetch returns before the job is done.
const POLL_BACKOFF: Duration = Duration::from_millis(250);

/// How a wait on the code runner ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Finished(ExecutionResult),
    TimedOut,
    /// The attempt closed while the job was still running.
    Cancelled,
    Failed(String),
}

/// One cancellation token per answer paper with code runs in flight.
/// Finalizing a paper cancels every grading wait started for it; an entry
/// is dropped once its last wait ends.
#[derive(Debug, Clone, Default)]
pub struct WaitRegistry {
    inner: Arc<Mutex<Waits>>,
}

#[derive(Debug, Default)]
struct Waits {
    next_generation: u64,
    by_paper: HashMap<i64, PaperWaits>,
}

#[derive(Debug)]
struct PaperWaits {
    generation: u64,
    token: CancellationToken,
    active: usize,
}

/// Keeps a paper's registry entry alive for the duration of one wait.
#[derive(Debug)]
pub struct WaitGuard {
    registry: WaitRegistry,
    paper_id: i64,
    generation: u64,
    token: CancellationToken,
}

impl WaitGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.registry.leave(self.paper_id, self.generation);
    }
}

impl WaitRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, Waits> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a wait on `paper_id`; its token fires when the paper is cancelled.
    pub fn enter(&self, paper_id: i64) -> WaitGuard {
        let mut waits = self.lock();
        let fresh = waits.next_generation;
        waits.next_generation += 1;

        let entry = waits.by_paper.entry(paper_id).or_insert_with(|| PaperWaits {
            generation: fresh,
            token: CancellationToken::new(),
            active: 0,
        });
        entry.active += 1;

        WaitGuard {
            registry: self.clone(),
            paper_id,
            generation: entry.generation,
            token: entry.token.child_token(),
        }
    }

    fn leave(&self, paper_id: i64, generation: u64) {
        let mut waits = self.lock();
        let finished = match waits.by_paper.get_mut(&paper_id) {
            Some(entry) if entry.generation == generation => {
                entry.active -= 1;
                entry.active == 0
            }
            _ => false,
        };
        if finished {
            waits.by_paper.remove(&paper_id);
        }
    }

    pub fn cancel(&self, paper_id: i64) {
        let entry = self.lock().by_paper.remove(&paper_id);
        if let Some(entry) = entry {
            entry.token.cancel();
        }
    }

    /// Papers with at least one wait in flight.
    pub fn len(&self) -> usize {
        self.lock().by_paper.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Routes code answers to the execution service and waits for their results.
pub struct GradingDispatcher {
    executor: Arc<dyn CodeExecutor>,
    waits: WaitRegistry,
    workdir_root: String,
}

impl GradingDispatcher {
    pub fn new(executor: Arc<dyn CodeExecutor>, workdir_root: impl Into<String>) -> Self {
        Self {
            executor,
            waits: WaitRegistry::default(),
            workdir_root: workdir_root.into(),
        }
    }

    pub fn with_workdir_root(mut self, root: impl Into<String>) -> Self {
        self.workdir_root = root.into();
        self
    }

    pub fn waits(&self) -> &WaitRegistry {
        &self.waits
    }

    pub fn workdir(&self, user_id: i64) -> String {
        format!("{}/user_{}", self.workdir_root.trim_end_matches('/'), user_id)
    }

    pub async fn submit(
        &self,
        language: &str,
        payload: &JobPayload,
        workdir: &str,
    ) -> Result<String, ExecutorError> {
        self.executor.submit(language, payload, workdir).await
    }

    /// Waits for the job until it finishes, `budget` elapses or `cancel` fires,
    /// whichever comes first.
    pub async fn wait(
        &self,
        correlation_id: &str,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        if budget.is_zero() {
            return RunOutcome::TimedOut;
        }
        let deadline = Instant::now() + budget;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return RunOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return RunOutcome::TimedOut,
                status = self.executor.fetch(correlation_id, true) => match status {
                    Ok(JobStatus::Done(result)) => return RunOutcome::Finished(result),
                    Ok(JobStatus::Running | JobStatus::NotStarted) => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return RunOutcome::Cancelled,
                            _ = tokio::time::sleep_until(deadline) => return RunOutcome::TimedOut,
                            _ = tokio::time::sleep(POLL_BACKOFF) => {}
                        }
                    }
                    Err(e) => return RunOutcome::Failed(e.to_string()),
                },
            }
        }
    }
}

/// Maps a runner outcome to a verdict. A code answer is accepted only when it
/// passes, so a failed run keeps the learner on the question.
pub fn code_verdict(question: &Question, payload: &JobPayload, outcome: RunOutcome) -> Verdict {
    let failed = |detail: String| Verdict {
        accepted: false,
        success: false,
        marks: 0.0,
        detail: vec![detail],
    };

    match outcome {
        RunOutcome::Finished(result) => {
            let marks = code_marks(question, payload, &result);
            let detail = if result.success {
                vec![CORRECT.to_string()]
            } else if result.error.is_empty() {
                vec![INCORRECT.to_string()]
            } else {
                result.error
            };
            Verdict {
                accepted: result.success,
                success: result.success,
                marks,
                detail,
            }
        }
        RunOutcome::TimedOut => failed("Code execution did not finish in time".to_string()),
        RunOutcome::Cancelled => failed("Attempt closed before grading finished".to_string()),
        RunOutcome::Failed(e) => failed(format!("Code execution failed: {}", e)),
    }
}

fn code_marks(question: &Question, payload: &JobPayload, result: &ExecutionResult) -> f64 {
    let total_weight: f64 = payload.reference_assertions.iter().map(|tc| tc.weight()).sum();
    let marks = if question.partial_grading && total_weight > 0.0 {
        question.points * result.weight / total_weight
    } else if result.success {
        question.points
    } else {
        0.0
    };
    marks.clamp(0.0, question.points)
}

/// A verdict and the correlation id the answer row must still carry for it
/// to be applied.
pub(crate) struct Resolution {
    pub verdict: Verdict,
    pub correlation_id: Option<String>,
    /// `false` when the runner gave no result: timeout, cancellation or failure.
    pub settled: bool,
}

/// Response to a submitted answer.
#[derive(Debug, Serialize)]
pub struct SubmitResult {
    pub accepted: bool,
    pub success: bool,
    pub detail: Vec<String>,
    pub marks: f64,
    pub next_question: NextQuestion,
}

impl QuizEngine {
    /// Records a new answer for `question_id`, grades it and moves the
    /// sequencer on when the answer is accepted.
    pub async fn submit_answer(
        &self,
        paper_id: i64,
        question_id: i64,
        value: SubmittedValue,
    ) -> Result<Outcome<SubmitResult>, AppError> {
        let attempt = match self.live_attempt(paper_id).await? {
            Ok(attempt) => attempt,
            Err(refusal) => return Ok(Err(refusal)),
        };
        let question = self.question_in(&attempt, question_id).await?;
        let test_cases = self.store.get_test_cases(question_id).await?;

        let check = validator::check(&question, &test_cases, &value)?;

        let answer = self
            .store
            .insert_answer(NewAnswer {
                answer_paper_id: paper_id,
                question_id,
                answer: value.clone(),
                skipped: false,
                correlation_id: None,
            })
            .await?;

        if let (QuestionKind::Upload, SubmittedValue::Upload(file_name)) = (question.kind, &value) {
            self.store
                .save_upload(AssignmentUpload {
                    user_id: attempt.paper.user_id,
                    question_id,
                    question_paper_id: attempt.question_paper.id,
                    file_name: file_name.clone(),
                    uploaded_at: self.now(),
                })
                .await?;
        }

        let budget = self.time_left_of(&attempt);
        let wait = matches!(check, Check::Dispatch(_)).then(|| self.dispatcher.waits().enter(paper_id));
        let cancel = wait.as_ref().map(|w| w.token().clone()).unwrap_or_default();
        let Resolution {
            verdict,
            correlation_id,
            ..
        } = self
            .resolve(&attempt, &question, &answer, check, budget, &cancel)
            .await?;
        drop(wait);

        // The write only lands while the paper is still inprogress.
        let applied = self
            .store
            .apply_grade(answer.id, correlation_id.as_deref(), &verdict.to_grade(), true)
            .await?;

        if !applied {
            let attempt = self.load_attempt(paper_id).await?;
            if !attempt.paper.is_inprogress() {
                tracing::warn!(
                    "Discarding late result for answer {} on closed paper {}",
                    answer.id,
                    paper_id
                );
                return Ok(Err(Refusal::AttemptCompleted {
                    attempt_number: attempt.paper.attempt_number,
                }));
            }
            tracing::warn!("Grade for answer {} was superseded by a newer dispatch", answer.id);
        }

        let accepted = applied && verdict.accepted;
        let next_question = if accepted {
            self.add_completed_question(paper_id, question_id).await?
        } else {
            self.deliver(&attempt, &question).await?
        };

        if applied {
            self.rescore(paper_id).await?;
        }

        tracing::info!(
            "Paper {} question {}: accepted={} success={} marks={}",
            paper_id,
            question_id,
            accepted,
            verdict.success,
            verdict.marks
        );

        Ok(Ok(SubmitResult {
            accepted,
            success: verdict.success,
            detail: verdict.detail,
            marks: verdict.marks,
            next_question,
        }))
    }

    /// Turns a check into a verdict, running code through the executor.
    pub(crate) async fn resolve(
        &self,
        attempt: &Attempt,
        question: &Question,
        answer: &Answer,
        check: Check,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<Resolution, AppError> {
        let payload = match check {
            Check::Verdict(verdict) => {
                return Ok(Resolution {
                    verdict,
                    correlation_id: answer.correlation_id.clone(),
                    settled: true,
                });
            }
            Check::Dispatch(payload) => payload,
        };

        let workdir = self.dispatcher.workdir(attempt.paper.user_id);
        let correlation_id = match self
            .dispatcher
            .submit(&question.language, &payload, &workdir)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Could not dispatch answer {}: {}", answer.id, e);
                return Ok(Resolution {
                    verdict: code_verdict(question, &payload, RunOutcome::Failed(e.to_string())),
                    correlation_id: answer.correlation_id.clone(),
                    settled: false,
                });
            }
        };

        self.store
            .set_correlation_id(answer.id, &correlation_id)
            .await?;
        tracing::debug!(
            "Answer {} dispatched as job {} with a {:?} budget",
            answer.id,
            correlation_id,
            budget
        );

        let outcome = self.dispatcher.wait(&correlation_id, budget, cancel).await;
        match &outcome {
            RunOutcome::TimedOut => {
                tracing::warn!("Job {} for answer {} timed out", correlation_id, answer.id)
            }
            RunOutcome::Cancelled => {
                tracing::info!("Job {} for answer {} cancelled", correlation_id, answer.id)
            }
            RunOutcome::Failed(e) => {
                tracing::warn!("Job {} for answer {} failed: {}", correlation_id, answer.id, e)
            }
            RunOutcome::Finished(_) => {}
        }

        let settled = matches!(outcome, RunOutcome::Finished(_));
        Ok(Resolution {
            verdict: code_verdict(question, &payload, outcome),
            correlation_id: Some(correlation_id),
            settled,
        })
    }
}
