// tests/engine_tests.rs

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use exam_engine::{
    engine::{Clock, ManualClock, NextQuestion, QuizEngine, Refusal, StartOutcome},
    error::AppError,
    executor::{CodeExecutor, ExecutionResult, ExecutorError, JobPayload, JobStatus},
    models::{
        answer_paper::{AnswerGrade, AnswerPaper, PaperStatus, SubmittedValue},
        question::{CreateQuestionRequest, Question, QuestionKind, RunArgs, StringCheck, TestCaseKind},
        quiz::{CreatePaperRequest, CreateQuestionSetRequest, CreateQuizRequest, QuestionPaper, Quiz},
    },
    store::{AttemptStore, MemoryStore},
};
use tokio::sync::Notify;

const GOOD_SOURCE: &str = "def add(a, b):\n    return a + b";
const BAD_SOURCE: &str = "def add(a, b):\n    return a - b";

/// Code runner double: sources containing `a + b` pass every assertion.
#[derive(Default)]
struct ScriptedExecutor {
    jobs: Mutex<HashMap<String, JobPayload>>,
    next: AtomicUsize,
    /// Never report a result.
    hang: bool,
    /// Reject every submission.
    down: AtomicBool,
    /// Hold `job-0` until `release` fires, then report it as failing.
    hold_first: bool,
    release: Notify,
    submitted: Notify,
}

impl ScriptedExecutor {
    fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    fn down() -> Self {
        Self {
            down: AtomicBool::new(true),
            ..Self::default()
        }
    }

    fn holding_first() -> Self {
        Self {
            hold_first: true,
            ..Self::default()
        }
    }

    fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[async_trait]
impl CodeExecutor for ScriptedExecutor {
    async fn submit(
        &self,
        _language: &str,
        payload: &JobPayload,
        _workdir: &str,
    ) -> Result<String, ExecutorError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ExecutorError::Protocol("runner pool is down".to_string()));
        }
        let uid = format!("job-{}", self.next.fetch_add(1, Ordering::SeqCst));
        self.jobs.lock().unwrap().insert(uid.clone(), payload.clone());
        self.submitted.notify_one();
        Ok(uid)
    }

    async fn fetch(&self, correlation_id: &str, _block: bool) -> Result<JobStatus, ExecutorError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.hold_first && correlation_id == "job-0" {
            self.release.notified().await;
            return Ok(JobStatus::Done(ExecutionResult {
                success: false,
                weight: 0.0,
                error: vec!["Killed: worker restarted".to_string()],
            }));
        }
        let payload = self
            .jobs
            .lock()
            .unwrap()
            .get(correlation_id)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownJob(correlation_id.to_string()))?;

        let passed = payload.submitted_source.contains("a + b");
        Ok(JobStatus::Done(ExecutionResult {
            success: passed,
            weight: if passed {
                payload.reference_assertions.iter().map(|tc| tc.weight()).sum()
            } else {
                0.0
            },
            error: if passed {
                Vec::new()
            } else {
                vec!["AssertionError: add(1, 2) != 3".to_string()]
            },
        }))
    }
}

struct Fixture {
    engine: Arc<QuizEngine>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    executor: Arc<ScriptedExecutor>,
}

fn fixture_with(executor: ScriptedExecutor) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let executor = Arc::new(executor);
    let engine = QuizEngine::new(store.clone(), executor.clone())
        .with_clock(clock.clone())
        .with_regrade_timeout(std::time::Duration::from_secs(2));

    Fixture {
        engine: Arc::new(engine),
        store,
        clock,
        executor,
    }
}

fn fixture() -> Fixture {
    fixture_with(ScriptedExecutor::default())
}

fn quiz_request(fx: &Fixture) -> CreateQuizRequest {
    CreateQuizRequest {
        description: "Week 3 quiz".to_string(),
        start_date_time: Some(fx.clock.now() - Duration::days(1)),
        end_date_time: Some(fx.clock.now() + Duration::days(30)),
        duration_minutes: 30,
        active: true,
        pass_criteria: 40.0,
        attempts_allowed: 1,
        time_between_attempts: 0.0,
        allow_skip: true,
        prerequisite_quiz_id: None,
        prerequisite_requires_pass: false,
    }
}

async fn question(fx: &Fixture, kind: QuestionKind, points: f64, cases: Vec<TestCaseKind>) -> Question {
    let question = fx
        .store
        .create_question(&CreateQuestionRequest {
            summary: format!("{} question", kind),
            description: String::new(),
            points,
            language: "python".to_string(),
            kind,
            active: true,
            partial_grading: false,
            snippet: String::new(),
            ref_code_path: None,
            run_args: RunArgs::default(),
        })
        .await
        .unwrap();
    for case in cases {
        fx.store.add_test_case(question.id, case).await.unwrap();
    }
    question
}

async fn paper(fx: &Fixture, quiz: &Quiz, fixed: Vec<i64>, sets: Vec<CreateQuestionSetRequest>) -> QuestionPaper {
    let paper = fx
        .store
        .create_question_paper(&CreatePaperRequest {
            quiz_id: quiz.id,
            fixed_questions: fixed,
            fixed_question_order: None,
            shuffle_questions: false,
            shuffle_testcases: true,
            question_sets: sets,
        })
        .await
        .unwrap();
    fx.engine.update_total_marks(paper.id).await.unwrap();
    paper
}

fn add_assertion() -> TestCaseKind {
    TestCaseKind::Standard {
        test_case: "assert add(1, 2) == 3".to_string(),
        weight: 1.0,
        test_case_args: String::new(),
        hidden: false,
    }
}

fn mcq_option(text: &str, correct: bool) -> TestCaseKind {
    TestCaseKind::Mcq {
        options: text.to_string(),
        correct,
    }
}

async fn started(fx: &Fixture, user_id: i64, qp: &QuestionPaper) -> AnswerPaper {
    match fx.engine.start(user_id, qp.id, None).await.unwrap() {
        StartOutcome::Started(paper) => paper,
        other => panic!("expected a new attempt, got {:?}", other),
    }
}

async fn reload(fx: &Fixture, paper_id: i64) -> AnswerPaper {
    fx.store.get_answer_paper(paper_id).await.unwrap().unwrap()
}

#[tokio::test]
async fn code_resubmission_then_regrade_scores_full_marks() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let code = question(&fx, QuestionKind::Code, 1.0, vec![add_assertion()]).await;
    let qp = paper(&fx, &quiz, vec![code.id], vec![]).await;
    let ap = started(&fx, 7, &qp).await;

    let wrong = fx
        .engine
        .submit_answer(ap.id, code.id, SubmittedValue::Code(BAD_SOURCE.to_string()))
        .await
        .unwrap()
        .unwrap();
    assert!(!wrong.accepted);
    assert!(!wrong.success);
    assert_eq!(wrong.next_question.question_id(), Some(code.id));
    assert_eq!(reload(&fx, ap.id).await.questions_left(), 1);

    fx.clock.advance(Duration::minutes(10));
    let right = fx
        .engine
        .submit_answer(ap.id, code.id, SubmittedValue::Code(GOOD_SOURCE.to_string()))
        .await
        .unwrap()
        .unwrap();
    assert!(right.accepted);
    assert!(right.success);
    assert!(matches!(right.next_question, NextQuestion::NoMoreQuestions));

    let first = fx.engine.regrade(ap.id, code.id).await.unwrap();
    let second = fx.engine.regrade(ap.id, code.id).await.unwrap();
    assert_eq!(first.marks, 1.0);
    assert_eq!(first.marks, second.marks);
    assert!(!second.changed);

    let paper = reload(&fx, ap.id).await;
    assert_eq!(paper.marks_obtained, 1.0);
    assert_eq!(paper.percent, Some(100.0));
    assert_eq!(paper.passed, Some(true));
    assert_eq!(paper.start_time, ap.start_time);
    assert_eq!(paper.attempt_number, 1);
    assert_eq!(fx.executor.job_count(), 4);
    assert!(fx.engine.dispatcher().waits().is_empty());
}

#[tokio::test]
async fn mcc_needs_every_correct_option_and_latest_answer_counts() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let mcc = question(
        &fx,
        QuestionKind::Mcc,
        2.0,
        vec![
            mcq_option("A", true),
            mcq_option("B", false),
            mcq_option("C", true),
        ],
    )
    .await;
    let qp = paper(&fx, &quiz, vec![mcc.id], vec![]).await;
    let ap = started(&fx, 1, &qp).await;

    let options = fx.engine.option_order(ap.id, mcc.id).await.unwrap();
    let id_of = |text: &str| options.iter().find(|o| o.text == text).unwrap().id;

    let partial = fx
        .engine
        .submit_answer(ap.id, mcc.id, SubmittedValue::Choices(vec![id_of("A")]))
        .await
        .unwrap()
        .unwrap();
    assert!(!partial.success);
    assert_eq!(partial.marks, 0.0);

    let full = fx
        .engine
        .submit_answer(ap.id, mcc.id, SubmittedValue::Choices(vec![id_of("C"), id_of("A")]))
        .await
        .unwrap()
        .unwrap();
    assert!(full.success);
    assert_eq!(full.marks, 2.0);

    // Resubmitting the same correct answer must not double count.
    fx.engine
        .submit_answer(ap.id, mcc.id, SubmittedValue::Choices(vec![id_of("A"), id_of("C")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reload(&fx, ap.id).await.marks_obtained, 2.0);

    let summary = fx.engine.answer_summary(ap.id).await.unwrap();
    assert_eq!(summary[0].attempts, 3);
    assert_eq!(summary[0].marks, 2.0);
}

#[tokio::test]
async fn float_answers_use_the_error_margin() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let float = question(
        &fx,
        QuestionKind::Float,
        1.0,
        vec![TestCaseKind::Float {
            correct: 100.0,
            error_margin: 0.1,
        }],
    )
    .await;
    let qp = paper(&fx, &quiz, vec![float.id], vec![]).await;
    let ap = started(&fx, 1, &qp).await;

    let close = fx
        .engine
        .submit_answer(ap.id, float.id, SubmittedValue::Float(99.95))
        .await
        .unwrap()
        .unwrap();
    assert!(close.success);

    let far = fx
        .engine
        .submit_answer(ap.id, float.id, SubmittedValue::Float(99.8))
        .await
        .unwrap()
        .unwrap();
    assert!(!far.success);
    assert_eq!(reload(&fx, ap.id).await.marks_obtained, 0.0);
}

#[tokio::test]
async fn second_start_after_the_only_attempt_is_refused() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let q = question(&fx, QuestionKind::Integer, 1.0, vec![TestCaseKind::Integer { correct: 42 }]).await;
    let qp = paper(&fx, &quiz, vec![q.id], vec![]).await;

    let ap = started(&fx, 3, &qp).await;
    let score = fx.engine.finalize(ap.id).await.unwrap();
    assert_eq!(score.marks_obtained, 0.0);
    assert_eq!(fx.engine.finalize(ap.id).await.unwrap(), score);

    match fx.engine.start(3, qp.id, None).await.unwrap() {
        StartOutcome::Refused(Refusal::AttemptsExhausted { allowed }) => assert_eq!(allowed, 1),
        other => panic!("expected attempts exhausted, got {:?}", other),
    }
    match fx.engine.start(3, qp.id, Some(1)).await.unwrap() {
        StartOutcome::Refused(Refusal::AttemptCompleted { attempt_number }) => {
            assert_eq!(attempt_number, 1)
        }
        other => panic!("expected attempt completed, got {:?}", other),
    }
}

#[tokio::test]
async fn arrange_order_is_stable_per_attempt_and_differs_between_learners() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let steps: Vec<TestCaseKind> = (1..=10)
        .map(|i| TestCaseKind::Arrange {
            options: format!("step {}", i),
        })
        .collect();
    let arrange = question(&fx, QuestionKind::Arrange, 1.0, steps).await;
    let qp = paper(&fx, &quiz, vec![arrange.id], vec![]).await;

    let a = started(&fx, 1, &qp).await;
    let b = started(&fx, 2, &qp).await;

    let order_a = fx.engine.option_order(a.id, arrange.id).await.unwrap();
    let again_a = fx.engine.option_order(a.id, arrange.id).await.unwrap();
    let order_b = fx.engine.option_order(b.id, arrange.id).await.unwrap();
    assert_eq!(order_a, again_a);
    assert_ne!(order_a, order_b);

    let NextQuestion::Question(delivered) = fx.engine.current_question(a.id).await.unwrap() else {
        panic!("question expected");
    };
    assert_eq!(delivered.options, order_a);

    // The expected answer is the authoring order, whatever the presentation.
    let mut authored: Vec<i64> = order_a.iter().map(|o| o.id).collect();
    authored.sort_unstable();
    let result = fx
        .engine
        .submit_answer(a.id, arrange.id, SubmittedValue::Order(authored))
        .await
        .unwrap()
        .unwrap();
    assert!(result.success);
}

#[tokio::test]
async fn start_is_idempotent_while_in_progress() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let q = question(&fx, QuestionKind::Integer, 1.0, vec![TestCaseKind::Integer { correct: 1 }]).await;
    let qp = paper(&fx, &quiz, vec![q.id], vec![]).await;

    let (first, second) = tokio::join!(
        fx.engine.start(5, qp.id, None),
        fx.engine.start(5, qp.id, Some(1))
    );
    let id_of = |outcome: StartOutcome| match outcome {
        StartOutcome::Started(p) | StartOutcome::Resumed(p) => p.id,
        StartOutcome::Refused(r) => panic!("unexpected refusal {:?}", r),
    };
    let first = id_of(first.unwrap());
    let second = id_of(second.unwrap());
    assert_eq!(first, second);

    let StartOutcome::Resumed(again) = fx.engine.start(5, qp.id, None).await.unwrap() else {
        panic!("expected resume");
    };
    assert_eq!(again.id, first);
    assert_eq!(fx.store.list_attempts(5, qp.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn expired_attempt_closes_on_next_access() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let q = question(&fx, QuestionKind::Integer, 1.0, vec![TestCaseKind::Integer { correct: 1 }]).await;
    let other = question(&fx, QuestionKind::Integer, 1.0, vec![TestCaseKind::Integer { correct: 2 }]).await;
    let qp = paper(&fx, &quiz, vec![q.id, other.id], vec![]).await;
    let ap = started(&fx, 1, &qp).await;

    fx.engine
        .submit_answer(ap.id, q.id, SubmittedValue::Integer(1))
        .await
        .unwrap()
        .unwrap();

    fx.clock.advance(Duration::minutes(45));
    assert!(fx.engine.time_left(ap.id).await.unwrap().is_zero());

    let next = fx.engine.current_question(ap.id).await.unwrap();
    assert!(matches!(next, NextQuestion::AttemptClosed));

    let paper = reload(&fx, ap.id).await;
    assert_eq!(paper.status, PaperStatus::Completed);
    assert_eq!(paper.marks_obtained, 1.0);
    assert_eq!(paper.percent, Some(50.0));
    assert_eq!(paper.end_time, ap.end_time);

    let late = fx
        .engine
        .submit_answer(ap.id, other.id, SubmittedValue::Integer(2))
        .await
        .unwrap();
    assert!(matches!(late, Err(Refusal::AttemptCompleted { .. })));
}

#[tokio::test]
async fn extra_time_reopens_an_expired_attempt() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let q = question(&fx, QuestionKind::Integer, 1.0, vec![TestCaseKind::Integer { correct: 1 }]).await;
    let qp = paper(&fx, &quiz, vec![q.id], vec![]).await;
    let ap = started(&fx, 1, &qp).await;

    fx.clock.advance(Duration::minutes(31));
    assert!(matches!(
        fx.engine.current_question(ap.id).await.unwrap(),
        NextQuestion::AttemptClosed
    ));

    let reopened = fx.engine.grant_extra_time(ap.id, 10.0).await.unwrap();
    assert_eq!(reopened.status, PaperStatus::InProgress);
    assert_eq!(
        fx.engine.time_left(ap.id).await.unwrap(),
        std::time::Duration::from_secs(600)
    );
    assert_eq!(
        fx.engine.current_question(ap.id).await.unwrap().question_id(),
        Some(q.id)
    );
}

#[tokio::test]
async fn cooldown_and_unlimited_attempts() {
    let fx = fixture();
    let mut req = quiz_request(&fx);
    req.attempts_allowed = -1;
    req.time_between_attempts = 1.0;
    let quiz = fx.store.create_quiz(&req).await.unwrap();
    let q = question(&fx, QuestionKind::Integer, 1.0, vec![TestCaseKind::Integer { correct: 1 }]).await;
    let qp = paper(&fx, &quiz, vec![q.id], vec![]).await;

    let first = started(&fx, 1, &qp).await;
    fx.engine.finalize(first.id).await.unwrap();

    match fx.engine.start(1, qp.id, None).await.unwrap() {
        StartOutcome::Refused(Refusal::CooldownActive { available_at }) => {
            assert_eq!(available_at, first.start_time + Duration::hours(1))
        }
        other => panic!("expected cooldown, got {:?}", other),
    }

    fx.clock.advance(Duration::hours(2));
    let second = started(&fx, 1, &qp).await;
    assert_eq!(second.attempt_number, 2);
}

#[tokio::test]
async fn prerequisite_must_be_passed_when_required() {
    let fx = fixture();
    let intro = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let mut req = quiz_request(&fx);
    req.prerequisite_quiz_id = Some(intro.id);
    req.prerequisite_requires_pass = true;
    let advanced = fx.store.create_quiz(&req).await.unwrap();

    let q = question(&fx, QuestionKind::Integer, 1.0, vec![TestCaseKind::Integer { correct: 9 }]).await;
    let intro_qp = paper(&fx, &intro, vec![q.id], vec![]).await;
    let advanced_qp = paper(&fx, &advanced, vec![q.id], vec![]).await;

    assert!(matches!(
        fx.engine.start(1, advanced_qp.id, None).await.unwrap(),
        StartOutcome::Refused(Refusal::PrerequisiteNotMet { requires_pass: true, .. })
    ));

    let ap = started(&fx, 1, &intro_qp).await;
    fx.engine
        .submit_answer(ap.id, q.id, SubmittedValue::Integer(9))
        .await
        .unwrap()
        .unwrap();
    let score = fx.engine.finalize(ap.id).await.unwrap();
    assert_eq!(score.passed, Some(true));

    started(&fx, 1, &advanced_qp).await;
}

#[tokio::test]
async fn inactive_or_closed_quiz_is_refused() {
    let fx = fixture();
    let mut req = quiz_request(&fx);
    req.active = false;
    let inactive = fx.store.create_quiz(&req).await.unwrap();

    let mut req = quiz_request(&fx);
    req.end_date_time = Some(fx.clock.now() - Duration::hours(1));
    let ended = fx.store.create_quiz(&req).await.unwrap();

    let q = question(&fx, QuestionKind::Integer, 1.0, vec![TestCaseKind::Integer { correct: 1 }]).await;
    for quiz in [inactive, ended] {
        let qp = paper(&fx, &quiz, vec![q.id], vec![]).await;
        assert!(matches!(
            fx.engine.start(1, qp.id, None).await.unwrap(),
            StartOutcome::Refused(Refusal::QuizInactive)
        ));
    }
}

#[tokio::test]
async fn empty_paper_cannot_be_started() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let qp = paper(&fx, &quiz, vec![], vec![]).await;

    let result = fx.engine.start(1, qp.id, None).await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
}

#[tokio::test]
async fn skip_cycles_and_keeps_code_drafts() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let code = question(&fx, QuestionKind::Code, 1.0, vec![add_assertion()]).await;
    let text = question(
        &fx,
        QuestionKind::String,
        1.0,
        vec![TestCaseKind::String {
            correct: "ownership".to_string(),
            string_check: StringCheck::Lower,
        }],
    )
    .await;
    let qp = paper(&fx, &quiz, vec![code.id, text.id], vec![]).await;
    let ap = started(&fx, 1, &qp).await;

    let next = fx
        .engine
        .skip(ap.id, code.id, Some(BAD_SOURCE.to_string()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.question_id(), Some(text.id));

    let next = fx.engine.skip(ap.id, text.id, None).await.unwrap().unwrap();
    assert_eq!(next.question_id(), Some(code.id));

    let answers = fx.store.list_answers(ap.id).await.unwrap();
    assert_eq!(answers.len(), 1);
    assert!(answers[0].skipped);
    assert_eq!(fx.executor.job_count(), 0);

    let done = fx
        .engine
        .submit_answer(ap.id, text.id, SubmittedValue::Text("Ownership".to_string()))
        .await
        .unwrap()
        .unwrap();
    assert!(done.success);
    assert_eq!(done.next_question.question_id(), Some(code.id));
}

#[tokio::test]
async fn skipping_can_be_disabled() {
    let fx = fixture();
    let mut req = quiz_request(&fx);
    req.allow_skip = false;
    let quiz = fx.store.create_quiz(&req).await.unwrap();
    let q = question(&fx, QuestionKind::Integer, 1.0, vec![TestCaseKind::Integer { correct: 1 }]).await;
    let qp = paper(&fx, &quiz, vec![q.id], vec![]).await;
    let ap = started(&fx, 1, &qp).await;

    let refused = fx.engine.skip(ap.id, q.id, None).await.unwrap();
    assert_eq!(refused.unwrap_err(), Refusal::SkipNotAllowed);
}

#[tokio::test]
async fn finalize_discards_a_pending_code_result() {
    let fx = fixture_with(ScriptedExecutor::hanging());
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let code = question(&fx, QuestionKind::Code, 1.0, vec![add_assertion()]).await;
    let qp = paper(&fx, &quiz, vec![code.id], vec![]).await;
    let ap = started(&fx, 1, &qp).await;

    let engine = fx.engine.clone();
    let pending = tokio::spawn(async move {
        engine
            .submit_answer(ap.id, code.id, SubmittedValue::Code(GOOD_SOURCE.to_string()))
            .await
    });

    fx.executor.submitted.notified().await;
    fx.engine.finalize(ap.id).await.unwrap();

    let outcome = pending.await.unwrap().unwrap();
    assert!(matches!(outcome, Err(Refusal::AttemptCompleted { .. })));

    let answers = fx.store.list_answers(ap.id).await.unwrap();
    assert_eq!(answers.len(), 1);
    assert!(!answers[0].correct);
    assert_eq!(reload(&fx, ap.id).await.marks_obtained, 0.0);
}

#[tokio::test]
async fn runner_failure_is_a_failed_submission() {
    let fx = fixture_with(ScriptedExecutor::down());
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let code = question(&fx, QuestionKind::Code, 1.0, vec![add_assertion()]).await;
    let qp = paper(&fx, &quiz, vec![code.id], vec![]).await;
    let ap = started(&fx, 1, &qp).await;

    let result = fx
        .engine
        .submit_answer(ap.id, code.id, SubmittedValue::Code(GOOD_SOURCE.to_string()))
        .await
        .unwrap()
        .unwrap();
    assert!(!result.success);
    assert!(!result.accepted);
    assert!(result.detail[0].contains("runner pool is down"));

    let paper = reload(&fx, ap.id).await;
    assert_eq!(paper.status, PaperStatus::InProgress);
    assert_eq!(paper.questions_left(), 1);
    assert_eq!(fx.store.list_answers(ap.id).await.unwrap()[0].error.0, result.detail);
}

#[tokio::test]
async fn uploads_are_stored_and_graded_by_hand() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let essay = question(&fx, QuestionKind::Upload, 5.0, vec![]).await;
    let qp = paper(&fx, &quiz, vec![essay.id], vec![]).await;
    let ap = started(&fx, 4, &qp).await;

    for name in ["draft.pdf", "final.pdf"] {
        let result = fx
            .engine
            .submit_answer(ap.id, essay.id, SubmittedValue::Upload(name.to_string()))
            .await
            .unwrap()
            .unwrap();
        assert!(result.accepted);
    }
    let upload = fx.store.get_upload(4, essay.id, qp.id).await.unwrap().unwrap();
    assert_eq!(upload.file_name, "final.pdf");

    let graded = fx
        .engine
        .set_marks(ap.id, essay.id, 9.0, Some("Well argued".to_string()))
        .await
        .unwrap();
    assert_eq!(graded.marks_obtained, 5.0);

    let regrade = fx.engine.regrade(ap.id, essay.id).await.unwrap();
    assert!(!regrade.changed);
    assert_eq!(reload(&fx, ap.id).await.marks_obtained, 5.0);
}

#[tokio::test]
async fn random_pools_are_sampled_per_attempt() {
    let fx = fixture();
    let mut req = quiz_request(&fx);
    req.attempts_allowed = -1;
    let quiz = fx.store.create_quiz(&req).await.unwrap();

    let fixed = question(&fx, QuestionKind::Integer, 3.0, vec![TestCaseKind::Integer { correct: 1 }]).await;
    let mut pool = Vec::new();
    for i in 0..6 {
        pool.push(
            question(&fx, QuestionKind::Integer, 2.0, vec![TestCaseKind::Integer { correct: i }])
                .await
                .id,
        );
    }
    let qp = paper(
        &fx,
        &quiz,
        vec![fixed.id],
        vec![CreateQuestionSetRequest {
            marks: 2.0,
            num_questions: 2,
            questions: pool.clone(),
        }],
    )
    .await;

    assert_eq!(fx.engine.update_total_marks(qp.id).await.unwrap(), 7.0);
    assert_eq!(fx.engine.update_total_marks(qp.id).await.unwrap(), 7.0);

    let mut drawn = HashSet::new();
    for _ in 0..8 {
        let ap = started(&fx, 1, &qp).await;
        assert_eq!(ap.questions_order.len(), 3);
        assert_eq!(ap.questions_order[0], fixed.id);
        assert!(ap.questions_order[1..].iter().all(|id| pool.contains(id)));
        drawn.extend(ap.questions_order[1..].iter().copied());
        fx.engine.finalize(ap.id).await.unwrap();
    }
    assert!(drawn.len() > 2);
}

#[tokio::test]
async fn regrade_keeps_marks_when_the_runner_is_down() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let code = question(&fx, QuestionKind::Code, 1.0, vec![add_assertion()]).await;
    let qp = paper(&fx, &quiz, vec![code.id], vec![]).await;
    let ap = started(&fx, 1, &qp).await;

    let submitted = fx
        .engine
        .submit_answer(ap.id, code.id, SubmittedValue::Code(GOOD_SOURCE.to_string()))
        .await
        .unwrap()
        .unwrap();
    assert!(submitted.accepted);
    fx.engine.finalize(ap.id).await.unwrap();

    fx.executor.down.store(true, Ordering::SeqCst);
    let regrade = fx.engine.regrade(ap.id, code.id).await.unwrap();
    assert!(!regrade.changed);
    assert_eq!(regrade.marks, 1.0);
    assert!(regrade.detail[0].contains("runner pool is down"));

    let answers = fx.store.list_answers(ap.id).await.unwrap();
    assert!(answers[0].correct);
    assert_eq!(answers[0].marks, 1.0);

    let paper = reload(&fx, ap.id).await;
    assert_eq!(paper.status, PaperStatus::Completed);
    assert_eq!(paper.marks_obtained, 1.0);
    assert_eq!(paper.percent, Some(100.0));
    assert_eq!(paper.passed, Some(true));
}

#[tokio::test]
async fn oversized_cooldown_refuses_without_overflow() {
    let fx = fixture();
    let mut req = quiz_request(&fx);
    req.attempts_allowed = -1;
    req.time_between_attempts = 1e12;
    let quiz = fx.store.create_quiz(&req).await.unwrap();
    let q = question(&fx, QuestionKind::Integer, 1.0, vec![TestCaseKind::Integer { correct: 1 }]).await;
    let qp = paper(&fx, &quiz, vec![q.id], vec![]).await;

    let first = started(&fx, 1, &qp).await;
    fx.engine.finalize(first.id).await.unwrap();

    match fx.engine.start(1, qp.id, None).await.unwrap() {
        StartOutcome::Refused(Refusal::CooldownActive { available_at }) => {
            assert_eq!(available_at, DateTime::<Utc>::MAX_UTC)
        }
        other => panic!("expected cooldown, got {:?}", other),
    }
}

#[tokio::test]
async fn no_waits_linger_after_submissions() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let int = question(&fx, QuestionKind::Integer, 1.0, vec![TestCaseKind::Integer { correct: 1 }]).await;
    let code = question(&fx, QuestionKind::Code, 1.0, vec![add_assertion()]).await;
    let qp = paper(&fx, &quiz, vec![int.id, code.id], vec![]).await;
    let ap = started(&fx, 1, &qp).await;

    fx.engine
        .submit_answer(ap.id, int.id, SubmittedValue::Integer(1))
        .await
        .unwrap()
        .unwrap();
    assert!(fx.engine.dispatcher().waits().is_empty());

    for source in [BAD_SOURCE, GOOD_SOURCE] {
        fx.engine
            .submit_answer(ap.id, code.id, SubmittedValue::Code(source.to_string()))
            .await
            .unwrap()
            .unwrap();
        assert!(fx.engine.dispatcher().waits().is_empty());
    }
}

#[tokio::test]
async fn live_grades_are_not_written_to_closed_papers() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let q = question(&fx, QuestionKind::Integer, 1.0, vec![TestCaseKind::Integer { correct: 1 }]).await;
    let qp = paper(&fx, &quiz, vec![q.id], vec![]).await;
    let ap = started(&fx, 1, &qp).await;

    fx.engine
        .submit_answer(ap.id, q.id, SubmittedValue::Integer(1))
        .await
        .unwrap()
        .unwrap();
    fx.engine.finalize(ap.id).await.unwrap();
    let answer = fx.store.list_answers(ap.id).await.unwrap().remove(0);

    let wipe = AnswerGrade {
        correct: false,
        marks: 0.0,
        error: vec!["late".to_string()],
    };
    assert!(!fx.store.apply_grade(answer.id, None, &wipe, true).await.unwrap());

    let stored = fx.store.list_answers(ap.id).await.unwrap().remove(0);
    assert!(stored.correct);
    assert_eq!(stored.marks, 1.0);
    assert_ne!(stored.error.0, wipe.error);
}

#[tokio::test]
async fn superseded_result_does_not_overwrite_a_regrade() {
    let fx = fixture_with(ScriptedExecutor::holding_first());
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let code = question(&fx, QuestionKind::Code, 1.0, vec![add_assertion()]).await;
    let qp = paper(&fx, &quiz, vec![code.id], vec![]).await;
    let ap = started(&fx, 1, &qp).await;

    let engine = fx.engine.clone();
    let pending = tokio::spawn(async move {
        engine
            .submit_answer(ap.id, code.id, SubmittedValue::Code(GOOD_SOURCE.to_string()))
            .await
    });

    loop {
        let answers = fx.store.list_answers(ap.id).await.unwrap();
        if answers.first().and_then(|a| a.correlation_id.as_deref()) == Some("job-0") {
            break;
        }
        tokio::task::yield_now().await;
    }

    let regrade = fx.engine.regrade(ap.id, code.id).await.unwrap();
    assert!(regrade.changed);
    assert_eq!(regrade.marks, 1.0);

    fx.executor.release.notify_one();
    let stale = pending.await.unwrap().unwrap().unwrap();
    assert!(!stale.accepted);
    assert!(!stale.success);

    let answers = fx.store.list_answers(ap.id).await.unwrap();
    assert_eq!(answers.len(), 1);
    assert!(answers[0].correct);
    assert_eq!(answers[0].correlation_id.as_deref(), Some("job-1"));
    assert_eq!(reload(&fx, ap.id).await.marks_obtained, 1.0);
}

#[tokio::test]
async fn total_marks_are_stored_and_stable() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let a = question(&fx, QuestionKind::Integer, 2.0, vec![TestCaseKind::Integer { correct: 1 }]).await;
    let b = question(&fx, QuestionKind::Integer, 3.5, vec![TestCaseKind::Integer { correct: 2 }]).await;
    let qp = paper(&fx, &quiz, vec![a.id, b.id], vec![]).await;

    for _ in 0..2 {
        assert_eq!(fx.engine.update_total_marks(qp.id).await.unwrap(), 5.5);
        let stored = fx.store.get_question_paper(qp.id).await.unwrap().unwrap();
        assert_eq!(stored.total_marks, 5.5);
    }
}

#[tokio::test]
async fn reopening_is_refused_while_a_newer_attempt_runs() {
    let fx = fixture();
    let mut req = quiz_request(&fx);
    req.attempts_allowed = -1;
    let quiz = fx.store.create_quiz(&req).await.unwrap();
    let q = question(&fx, QuestionKind::Integer, 1.0, vec![TestCaseKind::Integer { correct: 1 }]).await;
    let qp = paper(&fx, &quiz, vec![q.id], vec![]).await;

    let first = started(&fx, 1, &qp).await;
    fx.clock.advance(Duration::minutes(31));
    assert!(matches!(
        fx.engine.current_question(first.id).await.unwrap(),
        NextQuestion::AttemptClosed
    ));
    let second = started(&fx, 1, &qp).await;
    assert_eq!(second.attempt_number, 2);

    let reopened = fx.engine.grant_extra_time(first.id, 10.0).await;
    assert!(matches!(reopened, Err(AppError::Conflict(_))));
    assert_eq!(reload(&fx, first.id).await.status, PaperStatus::Completed);
}

#[tokio::test]
async fn refresh_closes_an_expired_attempt() {
    let fx = fixture();
    let quiz = fx.store.create_quiz(&quiz_request(&fx)).await.unwrap();
    let q = question(&fx, QuestionKind::Integer, 1.0, vec![TestCaseKind::Integer { correct: 1 }]).await;
    let qp = paper(&fx, &quiz, vec![q.id], vec![]).await;
    let ap = started(&fx, 1, &qp).await;

    let live = fx.engine.refresh_attempt(ap.id).await.unwrap();
    assert_eq!(live.paper.status, PaperStatus::InProgress);

    fx.clock.advance(Duration::minutes(31));
    let closed = fx.engine.refresh_attempt(ap.id).await.unwrap();
    assert_eq!(closed.paper.status, PaperStatus::Completed);
    assert_eq!(closed.paper.percent, Some(0.0));
    assert_eq!(reload(&fx, ap.id).await.status, PaperStatus::Completed);
}
