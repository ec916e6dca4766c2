// src/handlers/admin.rs

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use validator::Validate;

use crate::{
    engine::QuizEngine,
    error::AppError,
    models::{
        question::{CreateQuestionRequest, QuestionKind, TestCaseKind},
        quiz::{CreatePaperRequest, CreateQuizRequest},
    },
};

/// Adds a question to the bank.
/// Admin only.
pub async fn create_question(
    State(engine): State<Arc<QuizEngine>>,
    Json(payload): Json<CreateQuestionRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let question = engine.store().create_question(&payload).await?;
    tracing::info!("Created {} question {}", question.kind, question.id);

    Ok((StatusCode::CREATED, Json(question)))
}

/// Attaches a test case; its variant must fit the question kind.
/// Admin only.
pub async fn add_test_case(
    State(engine): State<Arc<QuizEngine>>,
    Path(question_id): Path<i64>,
    Json(payload): Json<TestCaseKind>,
) -> Result<impl IntoResponse, AppError> {
    let question = engine
        .store()
        .get_question(question_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Question {} not found", question_id)))?;

    if !payload.fits(question.kind) {
        return Err(AppError::BadRequest(format!(
            "Test case does not fit a {} question",
            question.kind
        )));
    }

    if question.kind == QuestionKind::Mcq && matches!(payload, TestCaseKind::Mcq { correct: true, .. }) {
        let existing = engine.store().get_test_cases(question_id).await?;
        if existing
            .iter()
            .any(|tc| matches!(tc.data.0, TestCaseKind::Mcq { correct: true, .. }))
        {
            return Err(AppError::BadRequest(format!(
                "Question {} already has its correct option",
                question_id
            )));
        }
    }

    let test_case = engine.store().add_test_case(question_id, payload).await?;
    Ok((StatusCode::CREATED, Json(test_case)))
}

/// Admin only.
pub async fn create_quiz(
    State(engine): State<Arc<QuizEngine>>,
    Json(payload): Json<CreateQuizRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    if let (Some(start), Some(end)) = (payload.start_date_time, payload.end_date_time) {
        if end <= start {
            return Err(AppError::BadRequest(
                "Quiz must end after it starts".to_string(),
            ));
        }
    }

    let quiz = engine.store().create_quiz(&payload).await?;
    Ok((StatusCode::CREATED, Json(quiz)))
}

/// Creates a paper template. Its total marks stay at zero until
/// `update_total_marks` is requested.
/// Admin only.
pub async fn create_paper(
    State(engine): State<Arc<QuizEngine>>,
    Json(payload): Json<CreatePaperRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let mut referenced = payload.fixed_questions.clone();
    for set in &payload.question_sets {
        referenced.extend(set.questions.iter().copied());
    }
    referenced.sort_unstable();
    referenced.dedup();

    let found = engine.store().get_questions(&referenced).await?;
    if let Some(missing) = referenced
        .iter()
        .find(|id| !found.iter().any(|q| q.id == **id))
    {
        return Err(AppError::NotFound(format!("Question {} not found", missing)));
    }

    let paper = engine.store().create_question_paper(&payload).await?;
    Ok((StatusCode::CREATED, Json(paper)))
}

/// Admin only.
pub async fn update_total_marks(
    State(engine): State<Arc<QuizEngine>>,
    Path(question_paper_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let total_marks = engine.update_total_marks(question_paper_id).await?;
    Ok(Json(json!({ "total_marks": total_marks })))
}

/// Admin only.
pub async fn regrade(
    State(engine): State<Arc<QuizEngine>>,
    Path((paper_id, question_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(engine.regrade(paper_id, question_id).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct SetMarksRequest {
    #[validate(range(min = 0.0))]
    pub marks: f64,
    #[validate(length(max = 2000))]
    pub comment: Option<String>,
}

/// Manual grading of the latest answer to a question.
/// Admin only.
pub async fn set_marks(
    State(engine): State<Arc<QuizEngine>>,
    Path((paper_id, question_id)): Path<(i64, i64)>,
    Json(payload): Json<SetMarksRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let paper = engine
        .set_marks(paper_id, question_id, payload.marks, payload.comment)
        .await?;
    Ok(Json(paper))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ExtraTimeRequest {
    #[validate(range(exclusive_min = 0.0, max = 1440.0))]
    pub minutes: f64,
}

/// Admin only.
pub async fn grant_extra_time(
    State(engine): State<Arc<QuizEngine>>,
    Path(paper_id): Path<i64>,
    Json(payload): Json<ExtraTimeRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let paper = engine.grant_extra_time(paper_id, payload.minutes).await?;
    Ok(Json(paper))
}
