// src/handlers/attempt.rs

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    engine::{Attempt, QuizEngine, Refusal, StartOutcome},
    error::AppError,
    models::answer_paper::{AnswerPaper, QuestionSummary, SubmittedValue},
    utils::jwt::Claims,
};

/// Renders a refusal as 403 with its machine-readable reason.
pub fn refused(refusal: Refusal) -> Response {
    let message = refusal.to_string();
    (
        StatusCode::FORBIDDEN,
        Json(json!({
            "refused": refusal,
            "message": message,
        })),
    )
        .into_response()
}

/// Loads a paper and checks that it belongs to the caller. Staff may read any paper.
/// A paper whose time ran out is closed on the way.
pub async fn owned_attempt(
    engine: &QuizEngine,
    claims: &Claims,
    paper_id: i64,
) -> Result<Attempt, AppError> {
    let attempt = engine.load_attempt(paper_id).await?;
    if attempt.paper.user_id != claims.user_id()? && !claims.is_staff() {
        return Err(AppError::Forbidden(format!(
            "Answer paper {} belongs to another user",
            paper_id
        )));
    }
    if attempt.paper.is_inprogress() && engine.time_left_of(&attempt).is_zero() {
        return engine.refresh_attempt(paper_id).await;
    }
    Ok(attempt)
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub attempt_number: Option<i32>,
}

/// Starts a new attempt or resumes the live one.
/// 201 when created, 200 when resumed.
pub async fn start_attempt(
    State(engine): State<Arc<QuizEngine>>,
    Extension(claims): Extension<Claims>,
    Path(question_paper_id): Path<i64>,
    Json(payload): Json<StartRequest>,
) -> Result<Response, AppError> {
    let user_id = claims.user_id()?;

    let response = match engine
        .start(user_id, question_paper_id, payload.attempt_number)
        .await?
    {
        StartOutcome::Started(paper) => (StatusCode::CREATED, Json(paper)).into_response(),
        StartOutcome::Resumed(paper) => (StatusCode::OK, Json(paper)).into_response(),
        StartOutcome::Refused(refusal) => {
            tracing::info!(
                "User {} refused on question paper {}: {}",
                user_id,
                question_paper_id,
                refusal
            );
            refused(refusal)
        }
    };
    Ok(response)
}

pub async fn current_question(
    State(engine): State<Arc<QuizEngine>>,
    Extension(claims): Extension<Claims>,
    Path(paper_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    owned_attempt(&engine, &claims, paper_id).await?;
    Ok(Json(engine.current_question(paper_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub value: SubmittedValue,
}

pub async fn submit_answer(
    State(engine): State<Arc<QuizEngine>>,
    Extension(claims): Extension<Claims>,
    Path((paper_id, question_id)): Path<(i64, i64)>,
    Json(payload): Json<AnswerRequest>,
) -> Result<Response, AppError> {
    owned_attempt(&engine, &claims, paper_id).await?;

    match engine.submit_answer(paper_id, question_id, payload.value).await? {
        Ok(result) => Ok(Json(result).into_response()),
        Err(refusal) => Ok(refused(refusal)),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SkipRequest {
    /// Unsubmitted code to keep with the skip.
    pub draft: Option<String>,
}

pub async fn skip_question(
    State(engine): State<Arc<QuizEngine>>,
    Extension(claims): Extension<Claims>,
    Path((paper_id, question_id)): Path<(i64, i64)>,
    Json(payload): Json<SkipRequest>,
) -> Result<Response, AppError> {
    owned_attempt(&engine, &claims, paper_id).await?;

    match engine.skip(paper_id, question_id, payload.draft).await? {
        Ok(next) => Ok(Json(next).into_response()),
        Err(refusal) => Ok(refused(refusal)),
    }
}

pub async fn question_options(
    State(engine): State<Arc<QuizEngine>>,
    Extension(claims): Extension<Claims>,
    Path((paper_id, question_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, AppError> {
    owned_attempt(&engine, &claims, paper_id).await?;
    Ok(Json(engine.option_order(paper_id, question_id).await?))
}

pub async fn finalize_attempt(
    State(engine): State<Arc<QuizEngine>>,
    Extension(claims): Extension<Claims>,
    Path(paper_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    owned_attempt(&engine, &claims, paper_id).await?;
    Ok(Json(engine.finalize(paper_id).await?))
}

#[derive(Debug, Serialize)]
pub struct AttemptView {
    pub paper: AnswerPaper,
    pub time_left_secs: u64,
    pub questions_left: usize,
    pub summary: Vec<QuestionSummary>,
}

pub async fn get_attempt(
    State(engine): State<Arc<QuizEngine>>,
    Extension(claims): Extension<Claims>,
    Path(paper_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let attempt = owned_attempt(&engine, &claims, paper_id).await?;

    let time_left_secs = if attempt.paper.is_inprogress() {
        engine.time_left_of(&attempt).as_secs()
    } else {
        0
    };
    let summary = engine.answer_summary(paper_id).await?;

    Ok(Json(AttemptView {
        questions_left: attempt.paper.questions_left(),
        paper: attempt.paper,
        time_left_secs,
        summary,
    }))
}
