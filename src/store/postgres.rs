// src/store/postgres.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, types::Json};

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

/// Postgres-backed store. The partial unique index
/// `answer_papers_one_inprogress` makes attempt creation race-free across processes.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_paper(&self, paper_id: i64) -> Result<AnswerPaper, AppError> {
        sqlx::query_as::<_, AnswerPaper>("SELECT * FROM answer_papers WHERE id = $1")
            .bind(paper_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Answer paper {} not found", paper_id)))
    }
}

#[async_trait]
impl AttemptStore for PgStore {
    async fn create_question(&self, req: &CreateQuestionRequest) -> Result<Question, AppError> {
        let question = sqlx::query_as::<_, Question>(
            r#"
            INSERT INTO questions
                (summary, description, points, language, type, active,
                 partial_grading, snippet, ref_code_path, run_args)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(&req.summary)
        .bind(&req.description)
        .bind(req.points)
        .bind(&req.language)
        .bind(req.kind.as_str())
        .bind(req.active)
        .bind(req.partial_grading)
        .bind(&req.snippet)
        .bind(&req.ref_code_path)
        .bind(Json(&req.run_args))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to create question: {:?}", e);
            AppError::from(e)
        })?;

        Ok(question)
    }

    async fn get_question(&self, id: i64) -> Result<Option<Question>, AppError> {
        let question = sqlx::query_as::<_, Question>("SELECT * FROM questions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(question)
    }

    async fn get_questions(&self, ids: &[i64]) -> Result<Vec<Question>, AppError> {
        let questions = sqlx::query_as::<_, Question>("SELECT * FROM questions WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        Ok(questions)
    }

    async fn add_test_case(&self, question_id: i64, data: TestCaseKind) -> Result<TestCase, AppError> {
        let test_case = sqlx::query_as::<_, TestCase>(
            "INSERT INTO test_cases (question_id, data) VALUES ($1, $2) RETURNING *",
        )
        .bind(question_id)
        .bind(Json(data))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if e.to_string().contains("foreign key") {
                AppError::NotFound(format!("Question {} not found", question_id))
            } else {
                tracing::error!("Failed to add test case: {:?}", e);
                AppError::from(e)
            }
        })?;

        Ok(test_case)
    }

    async fn get_test_cases(&self, question_id: i64) -> Result<Vec<TestCase>, AppError> {
        let test_cases = sqlx::query_as::<_, TestCase>(
            "SELECT * FROM test_cases WHERE question_id = $1 ORDER BY id",
        )
        .bind(question_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(test_cases)
    }

    async fn create_quiz(&self, req: &CreateQuizRequest) -> Result<Quiz, AppError> {
        let quiz = sqlx::query_as::<_, Quiz>(
            r#"
            INSERT INTO quizzes
                (description, start_date_time, end_date_time, duration_minutes, active,
                 pass_criteria, attempts_allowed, time_between_attempts, allow_skip,
                 prerequisite_quiz_id, prerequisite_requires_pass)
            VALUES ($1, COALESCE($2, NOW()), COALESCE($3, '2199-01-01T00:00:00Z'),
                    $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(&req.description)
        .bind(req.start_date_time)
        .bind(req.end_date_time)
        .bind(req.duration_minutes)
        .bind(req.active)
        .bind(req.pass_criteria)
        .bind(req.attempts_allowed)
        .bind(req.time_between_attempts)
        .bind(req.allow_skip)
        .bind(req.prerequisite_quiz_id)
        .bind(req.prerequisite_requires_pass)
        .fetch_one(&self.pool)
        .await?;

        Ok(quiz)
    }

    async fn get_quiz(&self, id: i64) -> Result<Option<Quiz>, AppError> {
        let quiz = sqlx::query_as::<_, Quiz>("SELECT * FROM quizzes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(quiz)
    }

    async fn create_question_paper(&self, req: &CreatePaperRequest) -> Result<QuestionPaper, AppError> {
        let mut tx = self.pool.begin().await?;

        let mut paper = sqlx::query_as::<_, QuestionPaper>(
            r#"
            INSERT INTO question_papers
                (quiz_id, fixed_questions, fixed_question_order, shuffle_questions, shuffle_testcases)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(req.quiz_id)
        .bind(req.fixed_questions.clone())
        .bind(req.fixed_question_order.clone())
        .bind(req.shuffle_questions)
        .bind(req.shuffle_testcases)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if e.to_string().contains("foreign key") {
                AppError::NotFound(format!("Quiz {} not found", req.quiz_id))
            } else {
                AppError::from(e)
            }
        })?;

        for set in &req.question_sets {
            let question_set = sqlx::query_as::<_, QuestionSet>(
                r#"
                INSERT INTO question_sets (question_paper_id, marks, num_questions, questions)
                VALUES ($1, $2, $3, $4)
                RETURNING *
                "#,
            )
            .bind(paper.id)
            .bind(set.marks)
            .bind(set.num_questions)
            .bind(set.questions.clone())
            .fetch_one(&mut *tx)
            .await?;
            paper.question_sets.push(question_set);
        }

        tx.commit().await?;
        Ok(paper)
    }

    async fn get_question_paper(&self, id: i64) -> Result<Option<QuestionPaper>, AppError> {
        let paper = sqlx::query_as::<_, QuestionPaper>("SELECT * FROM question_papers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(mut paper) = paper else {
            return Ok(None);
        };

        paper.question_sets = sqlx::query_as::<_, QuestionSet>(
            "SELECT * FROM question_sets WHERE question_paper_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(paper))
    }

    async fn set_total_marks(&self, question_paper_id: i64, total_marks: f64) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE question_papers SET total_marks = $1 WHERE id = $2")
            .bind(total_marks)
            .bind(question_paper_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Question paper {} not found",
                question_paper_id
            )));
        }
        Ok(())
    }

    async fn list_attempts(&self, user_id: i64, question_paper_id: i64) -> Result<Vec<AnswerPaper>, AppError> {
        let attempts = sqlx::query_as::<_, AnswerPaper>(
            r#"
            SELECT * FROM answer_papers
            WHERE user_id = $1 AND question_paper_id = $2
            ORDER BY attempt_number
            "#,
        )
        .bind(user_id)
        .bind(question_paper_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    async fn get_answer_paper(&self, id: i64) -> Result<Option<AnswerPaper>, AppError> {
        let paper = sqlx::query_as::<_, AnswerPaper>("SELECT * FROM answer_papers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(paper)
    }

    async fn get_or_create_inprogress(&self, new: NewAnswerPaper) -> Result<(AnswerPaper, bool), AppError> {
        // Any unique violation (same attempt number, or a second inprogress row)
        // turns the insert into a no-op; the loser then resumes the winner's row.
        let inserted = sqlx::query_as::<_, AnswerPaper>(
            r#"
            INSERT INTO answer_papers
                (user_id, question_paper_id, attempt_number, start_time, end_time, questions_order)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(new.user_id)
        .bind(new.question_paper_id)
        .bind(new.attempt_number)
        .bind(new.start_time)
        .bind(new.end_time)
        .bind(new.questions_order.clone())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(paper) = inserted {
            return Ok((paper, true));
        }

        let existing = sqlx::query_as::<_, AnswerPaper>(
            r#"
            SELECT * FROM answer_papers
            WHERE user_id = $1 AND question_paper_id = $2 AND status = 'inprogress'
            "#,
        )
        .bind(new.user_id)
        .bind(new.question_paper_id)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(paper) => Ok((paper, false)),
            None => Err(AppError::Conflict(format!(
                "Attempt {} already exists",
                new.attempt_number
            ))),
        }
    }

    async fn mark_answered(&self, paper_id: i64, question_id: i64) -> Result<AnswerPaper, AppError> {
        sqlx::query(
            r#"
            UPDATE answer_papers
            SET questions_answered = array_append(questions_answered, $2)
            WHERE id = $1 AND NOT ($2 = ANY(questions_answered))
            "#,
        )
        .bind(paper_id)
        .bind(question_id)
        .execute(&self.pool)
        .await?;

        self.fetch_paper(paper_id).await
    }

    async fn update_paper_scores(
        &self,
        paper_id: i64,
        status: PaperStatus,
        score: PaperScore,
        end_time: DateTime<Utc>,
    ) -> Result<AnswerPaper, AppError> {
        let paper = sqlx::query_as::<_, AnswerPaper>(
            r#"
            UPDATE answer_papers
            SET status = CASE WHEN status = 'completed' THEN status ELSE $2 END,
                marks_obtained = $3, percent = $4, passed = $5, end_time = $6
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(paper_id)
        .bind(status.as_str())
        .bind(score.marks_obtained)
        .bind(score.percent)
        .bind(score.passed)
        .bind(end_time)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Answer paper {} not found", paper_id)))?;

        Ok(paper)
    }

    async fn update_paper_window(&self, paper_id: i64, window: PaperWindow) -> Result<AnswerPaper, AppError> {
        let paper = sqlx::query_as::<_, AnswerPaper>(
            r#"
            UPDATE answer_papers
            SET start_time = $2, end_time = $3, extra_time = $4, status = $5
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(paper_id)
        .bind(window.start_time)
        .bind(window.end_time)
        .bind(window.extra_time)
        .bind(window.status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            // Re-opening collides with a newer inprogress attempt.
            if e.to_string().contains("answer_papers_one_inprogress") {
                AppError::Conflict("Learner already has an attempt in progress".to_string())
            } else {
                AppError::from(e)
            }
        })?
        .ok_or_else(|| AppError::NotFound(format!("Answer paper {} not found", paper_id)))?;

        Ok(paper)
    }

    async fn prerequisite_status(&self, user_id: i64, quiz_id: i64) -> Result<PrerequisiteStatus, AppError> {
        let (completed, passed): (bool, bool) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) > 0,
                COALESCE(BOOL_OR(ap.passed), FALSE)
            FROM answer_papers ap
            JOIN question_papers qp ON qp.id = ap.question_paper_id
            WHERE ap.user_id = $1 AND qp.quiz_id = $2 AND ap.status = 'completed'
            "#,
        )
        .bind(user_id)
        .bind(quiz_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(PrerequisiteStatus { completed, passed })
    }

    async fn insert_answer(&self, new: NewAnswer) -> Result<Answer, AppError> {
        let answer = sqlx::query_as::<_, Answer>(
            r#"
            INSERT INTO answers (answer_paper_id, question_id, answer, skipped, correlation_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(new.answer_paper_id)
        .bind(new.question_id)
        .bind(Json(&new.answer))
        .bind(new.skipped)
        .bind(&new.correlation_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to insert answer: {:?}", e);
            AppError::from(e)
        })?;

        Ok(answer)
    }

    async fn list_answers(&self, paper_id: i64) -> Result<Vec<Answer>, AppError> {
        let answers = sqlx::query_as::<_, Answer>(
            "SELECT * FROM answers WHERE answer_paper_id = $1 ORDER BY id",
        )
        .bind(paper_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(answers)
    }

    async fn set_correlation_id(&self, answer_id: i64, correlation_id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE answers SET correlation_id = $2 WHERE id = $1")
            .bind(answer_id)
            .bind(correlation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn apply_grade(
        &self,
        answer_id: i64,
        correlation_id: Option<&str>,
        grade: &AnswerGrade,
        live_only: bool,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE answers
            SET correct = $3, marks = $4, error = $5
            WHERE id = $1 AND correlation_id IS NOT DISTINCT FROM $2
              AND (NOT $6 OR EXISTS (
                  SELECT 1 FROM answer_papers
                  WHERE answer_papers.id = answers.answer_paper_id
                    AND answer_papers.status = 'inprogress'
              ))
            "#,
        )
        .bind(answer_id)
        .bind(correlation_id)
        .bind(grade.correct)
        .bind(grade.marks)
        .bind(Json(&grade.error))
        .bind(live_only)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_answer_marks(&self, answer_id: i64, marks: f64, comment: Option<String>) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE answers SET marks = $2, comment = COALESCE($3, comment) WHERE id = $1",
        )
        .bind(answer_id)
        .bind(marks)
        .bind(comment)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_option_order(
        &self,
        paper_id: i64,
        question_id: i64,
        candidate: &[i64],
    ) -> Result<Vec<i64>, AppError> {
        sqlx::query(
            r#"
            INSERT INTO test_case_orders (answer_paper_id, question_id, option_order)
            VALUES ($1, $2, $3)
            ON CONFLICT (answer_paper_id, question_id) DO NOTHING
            "#,
        )
        .bind(paper_id)
        .bind(question_id)
        .bind(candidate.to_vec())
        .execute(&self.pool)
        .await?;

        let (order,): (Vec<i64>,) = sqlx::query_as(
            "SELECT option_order FROM test_case_orders WHERE answer_paper_id = $1 AND question_id = $2",
        )
        .bind(paper_id)
        .bind(question_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(order)
    }

    async fn save_upload(&self, upload: AssignmentUpload) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO assignment_uploads (user_id, question_id, question_paper_id, file_name, uploaded_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, question_id, question_paper_id) DO UPDATE SET
                file_name = EXCLUDED.file_name,
                uploaded_at = EXCLUDED.uploaded_at
            "#,
        )
        .bind(upload.user_id)
        .bind(upload.question_id)
        .bind(upload.question_paper_id)
        .bind(&upload.file_name)
        .bind(upload.uploaded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_upload(
        &self,
        user_id: i64,
        question_id: i64,
        question_paper_id: i64,
    ) -> Result<Option<AssignmentUpload>, AppError> {
        let upload = sqlx::query_as::<_, AssignmentUpload>(
            r#"
            SELECT * FROM assignment_uploads
            WHERE user_id = $1 AND question_id = $2 AND question_paper_id = $3
            "#,
        )
        .bind(user_id)
        .bind(question_id)
        .bind(question_paper_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(upload)
    }
}
