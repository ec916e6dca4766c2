// src/store/memory.rs

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tokio::sync::RwLock;

use super::{AttemptStore, PaperWindow, PrerequisiteStatus};
use crate::{
    error::AppError,
    models::{
        answer_paper::{
            Answer, AnswerGrade, AnswerPaper, AssignmentUpload, NewAnswer, NewAnswerPaper,
            PaperScore, PaperStatus,
        },
        question::{CreateQuestionRequest, Question, TestCase, TestCaseKind},
        quiz::{CreatePaperRequest, CreateQuizRequest, QuestionPaper, QuestionSet, Quiz},
    },
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    questions: Vec<Question>,
    test_cases: Vec<TestCase>,
    quizzes: Vec<Quiz>,
    question_papers: Vec<QuestionPaper>,
    answer_papers: Vec<AnswerPaper>,
    answers: Vec<Answer>,
    option_orders: HashMap<(i64, i64), Vec<i64>>,
    uploads: HashMap<(i64, i64, i64), AssignmentUpload>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn paper_mut(&mut self, id: i64) -> Result<&mut AnswerPaper, AppError> {
        self.answer_papers
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Answer paper {} not found", id)))
    }

    fn answer_mut(&mut self, id: i64) -> Result<&mut Answer, AppError> {
        self.answers
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Answer {} not found", id)))
    }
}

/// In-process store. Every operation runs under one lock, which makes
/// `get_or_create_inprogress` atomic for all callers sharing the instance.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn create_question(&self, req: &CreateQuestionRequest) -> Result<Question, AppError> {
        let mut t = self.tables.write().await;
        let question = Question {
            id: t.next_id(),
            summary: req.summary.clone(),
            description: req.description.clone(),
            points: req.points,
            language: req.language.clone(),
            kind: req.kind,
            active: req.active,
            partial_grading: req.partial_grading,
            snippet: req.snippet.clone(),
            ref_code_path: req.ref_code_path.clone(),
            run_args: Json(req.run_args.clone()),
            created_at: Some(Utc::now()),
        };
        t.questions.push(question.clone());
        Ok(question)
    }

    async fn get_question(&self, id: i64) -> Result<Option<Question>, AppError> {
        let t = self.tables.read().await;
        Ok(t.questions.iter().find(|q| q.id == id).cloned())
    }

    async fn get_questions(&self, ids: &[i64]) -> Result<Vec<Question>, AppError> {
        let t = self.tables.read().await;
        Ok(t.questions
            .iter()
            .filter(|q| ids.contains(&q.id))
            .cloned()
            .collect())
    }

    async fn add_test_case(&self, question_id: i64, data: TestCaseKind) -> Result<TestCase, AppError> {
        let mut t = self.tables.write().await;
        if !t.questions.iter().any(|q| q.id == question_id) {
            return Err(AppError::NotFound(format!("Question {} not found", question_id)));
        }
        let test_case = TestCase {
            id: t.next_id(),
            question_id,
            data: Json(data),
        };
        t.test_cases.push(test_case.clone());
        Ok(test_case)
    }

    async fn get_test_cases(&self, question_id: i64) -> Result<Vec<TestCase>, AppError> {
        let t = self.tables.read().await;
        Ok(t.test_cases
            .iter()
            .filter(|tc| tc.question_id == question_id)
            .cloned()
            .collect())
    }

    async fn create_quiz(&self, req: &CreateQuizRequest) -> Result<Quiz, AppError> {
        let mut t = self.tables.write().await;
        let now = Utc::now();
        let quiz = Quiz {
            id: t.next_id(),
            description: req.description.clone(),
            start_date_time: req.start_date_time.unwrap_or(now),
            end_date_time: req
                .end_date_time
                .unwrap_or_else(|| now + chrono::Duration::days(365 * 100)),
            duration_minutes: req.duration_minutes,
            active: req.active,
            pass_criteria: req.pass_criteria,
            attempts_allowed: req.attempts_allowed,
            time_between_attempts: req.time_between_attempts,
            allow_skip: req.allow_skip,
            prerequisite_quiz_id: req.prerequisite_quiz_id,
            prerequisite_requires_pass: req.prerequisite_requires_pass,
        };
        t.quizzes.push(quiz.clone());
        Ok(quiz)
    }

    async fn get_quiz(&self, id: i64) -> Result<Option<Quiz>, AppError> {
        let t = self.tables.read().await;
        Ok(t.quizzes.iter().find(|q| q.id == id).cloned())
    }

    async fn create_question_paper(&self, req: &CreatePaperRequest) -> Result<QuestionPaper, AppError> {
        let mut t = self.tables.write().await;
        if !t.quizzes.iter().any(|q| q.id == req.quiz_id) {
            return Err(AppError::NotFound(format!("Quiz {} not found", req.quiz_id)));
        }
        let paper_id = t.next_id();
        let mut question_sets = Vec::with_capacity(req.question_sets.len());
        for set in &req.question_sets {
            question_sets.push(QuestionSet {
                id: t.next_id(),
                question_paper_id: paper_id,
                marks: set.marks,
                num_questions: set.num_questions,
                questions: set.questions.clone(),
            });
        }
        let paper = QuestionPaper {
            id: paper_id,
            quiz_id: req.quiz_id,
            fixed_questions: req.fixed_questions.clone(),
            fixed_question_order: req.fixed_question_order.clone(),
            shuffle_questions: req.shuffle_questions,
            shuffle_testcases: req.shuffle_testcases,
            total_marks: 0.0,
            question_sets,
        };
        t.question_papers.push(paper.clone());
        Ok(paper)
    }

    async fn get_question_paper(&self, id: i64) -> Result<Option<QuestionPaper>, AppError> {
        let t = self.tables.read().await;
        Ok(t.question_papers.iter().find(|p| p.id == id).cloned())
    }

    async fn set_total_marks(&self, question_paper_id: i64, total_marks: f64) -> Result<(), AppError> {
        let mut t = self.tables.write().await;
        let paper = t
            .question_papers
            .iter_mut()
            .find(|p| p.id == question_paper_id)
            .ok_or_else(|| AppError::NotFound(format!("Question paper {} not found", question_paper_id)))?;
        paper.total_marks = total_marks;
        Ok(())
    }

    async fn list_attempts(&self, user_id: i64, question_paper_id: i64) -> Result<Vec<AnswerPaper>, AppError> {
        let t = self.tables.read().await;
        let mut attempts: Vec<AnswerPaper> = t
            .answer_papers
            .iter()
            .filter(|p| p.user_id == user_id && p.question_paper_id == question_paper_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|p| p.attempt_number);
        Ok(attempts)
    }

    async fn get_answer_paper(&self, id: i64) -> Result<Option<AnswerPaper>, AppError> {
        let t = self.tables.read().await;
        Ok(t.answer_papers.iter().find(|p| p.id == id).cloned())
    }

    async fn get_or_create_inprogress(&self, new: NewAnswerPaper) -> Result<(AnswerPaper, bool), AppError> {
        let mut t = self.tables.write().await;

        if let Some(existing) = t.answer_papers.iter().find(|p| {
            p.user_id == new.user_id
                && p.question_paper_id == new.question_paper_id
                && p.status == PaperStatus::InProgress
        }) {
            return Ok((existing.clone(), false));
        }

        if t.answer_papers.iter().any(|p| {
            p.user_id == new.user_id
                && p.question_paper_id == new.question_paper_id
                && p.attempt_number == new.attempt_number
        }) {
            return Err(AppError::Conflict(format!(
                "Attempt {} already exists",
                new.attempt_number
            )));
        }

        let paper = AnswerPaper {
            id: t.next_id(),
            user_id: new.user_id,
            question_paper_id: new.question_paper_id,
            attempt_number: new.attempt_number,
            start_time: new.start_time,
            end_time: new.end_time,
            questions_order: new.questions_order,
            questions_answered: Vec::new(),
            status: PaperStatus::InProgress,
            marks_obtained: 0.0,
            percent: None,
            passed: None,
            extra_time: 0.0,
        };
        t.answer_papers.push(paper.clone());
        Ok((paper, true))
    }

    async fn mark_answered(&self, paper_id: i64, question_id: i64) -> Result<AnswerPaper, AppError> {
        let mut t = self.tables.write().await;
        let paper = t.paper_mut(paper_id)?;
        if !paper.questions_answered.contains(&question_id) {
            paper.questions_answered.push(question_id);
        }
        Ok(paper.clone())
    }

    async fn update_paper_scores(
        &self,
        paper_id: i64,
        status: PaperStatus,
        score: PaperScore,
        end_time: DateTime<Utc>,
    ) -> Result<AnswerPaper, AppError> {
        let mut t = self.tables.write().await;
        let paper = t.paper_mut(paper_id)?;
        if paper.status != PaperStatus::Completed {
            paper.status = status;
        }
        paper.marks_obtained = score.marks_obtained;
        paper.percent = score.percent;
        paper.passed = score.passed;
        paper.end_time = end_time;
        Ok(paper.clone())
    }

    async fn update_paper_window(&self, paper_id: i64, window: PaperWindow) -> Result<AnswerPaper, AppError> {
        let mut t = self.tables.write().await;
        let (user_id, question_paper_id) = {
            let paper = t.paper_mut(paper_id)?;
            (paper.user_id, paper.question_paper_id)
        };
        if window.status == PaperStatus::InProgress
            && t.answer_papers.iter().any(|p| {
                p.id != paper_id
                    && p.user_id == user_id
                    && p.question_paper_id == question_paper_id
                    && p.is_inprogress()
            })
        {
            return Err(AppError::Conflict(format!(
                "Another attempt of question paper {} is in progress",
                question_paper_id
            )));
        }
        let paper = t.paper_mut(paper_id)?;
        paper.start_time = window.start_time;
        paper.end_time = window.end_time;
        paper.extra_time = window.extra_time;
        paper.status = window.status;
        Ok(paper.clone())
    }

    async fn prerequisite_status(&self, user_id: i64, quiz_id: i64) -> Result<PrerequisiteStatus, AppError> {
        let t = self.tables.read().await;
        let paper_ids: Vec<i64> = t
            .question_papers
            .iter()
            .filter(|qp| qp.quiz_id == quiz_id)
            .map(|qp| qp.id)
            .collect();
        let mut status = PrerequisiteStatus::default();
        for paper in t.answer_papers.iter().filter(|p| {
            p.user_id == user_id
                && paper_ids.contains(&p.question_paper_id)
                && p.status == PaperStatus::Completed
        }) {
            status.completed = true;
            status.passed |= paper.passed == Some(true);
        }
        Ok(status)
    }

    async fn insert_answer(&self, new: NewAnswer) -> Result<Answer, AppError> {
        let mut t = self.tables.write().await;
        let answer = Answer {
            id: t.next_id(),
            answer_paper_id: new.answer_paper_id,
            question_id: new.question_id,
            answer: Json(new.answer),
            correct: false,
            marks: 0.0,
            error: Json(Vec::new()),
            skipped: new.skipped,
            comment: None,
            correlation_id: new.correlation_id,
            created_at: Utc::now(),
        };
        t.answers.push(answer.clone());
        Ok(answer)
    }

    async fn list_answers(&self, paper_id: i64) -> Result<Vec<Answer>, AppError> {
        let t = self.tables.read().await;
        Ok(t.answers
            .iter()
            .filter(|a| a.answer_paper_id == paper_id)
            .cloned()
            .collect())
    }

    async fn set_correlation_id(&self, answer_id: i64, correlation_id: &str) -> Result<(), AppError> {
        let mut t = self.tables.write().await;
        t.answer_mut(answer_id)?.correlation_id = Some(correlation_id.to_string());
        Ok(())
    }

    async fn apply_grade(
        &self,
        answer_id: i64,
        correlation_id: Option<&str>,
        grade: &AnswerGrade,
        live_only: bool,
    ) -> Result<bool, AppError> {
        let mut t = self.tables.write().await;
        let paper_id = t.answer_mut(answer_id)?.answer_paper_id;
        if live_only && !t.paper_mut(paper_id)?.is_inprogress() {
            return Ok(false);
        }
        let answer = t.answer_mut(answer_id)?;
        if answer.correlation_id.as_deref() != correlation_id {
            return Ok(false);
        }
        answer.correct = grade.correct;
        answer.marks = grade.marks;
        answer.error = Json(grade.error.clone());
        Ok(true)
    }

    async fn set_answer_marks(&self, answer_id: i64, marks: f64, comment: Option<String>) -> Result<(), AppError> {
        let mut t = self.tables.write().await;
        let answer = t.answer_mut(answer_id)?;
        answer.marks = marks;
        if comment.is_some() {
            answer.comment = comment;
        }
        Ok(())
    }

    async fn ensure_option_order(
        &self,
        paper_id: i64,
        question_id: i64,
        candidate: &[i64],
    ) -> Result<Vec<i64>, AppError> {
        let mut t = self.tables.write().await;
        let order = t
            .option_orders
            .entry((paper_id, question_id))
            .or_insert_with(|| candidate.to_vec());
        Ok(order.clone())
    }

    async fn save_upload(&self, upload: AssignmentUpload) -> Result<(), AppError> {
        let mut t = self.tables.write().await;
        t.uploads.insert(
            (upload.user_id, upload.question_id, upload.question_paper_id),
            upload,
        );
        Ok(())
    }

    async fn get_upload(
        &self,
        user_id: i64,
        question_id: i64,
        question_paper_id: i64,
    ) -> Result<Option<AssignmentUpload>, AppError> {
        let t = self.tables.read().await;
        Ok(t.uploads.get(&(user_id, question_id, question_paper_id)).cloned())
    }
}
