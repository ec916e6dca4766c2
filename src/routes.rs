// src/routes.rs

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{get, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    handlers::{admin, attempt},
    state::AppState,
    utils::jwt::{admin_middleware, auth_middleware},
};

/// Assembles the main application router.
///
/// * Learner routes: starting papers and working through attempts.
/// * Staff routes under `/api/admin`: authoring and grading.
/// * Every route requires a bearer token; staff routes also require the admin role.
pub fn create_router(state: AppState) -> Router {
    let origins = [
        HeaderValue::from_static("http://localhost:3000"),
        HeaderValue::from_static("http://127.0.0.1:3000"),
    ];

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let paper_routes = Router::new().route("/{qp_id}/start", post(attempt::start_attempt));

    let attempt_routes = Router::new()
        .route("/{paper_id}", get(attempt::get_attempt))
        .route("/{paper_id}/current", get(attempt::current_question))
        .route("/{paper_id}/finalize", post(attempt::finalize_attempt))
        .route(
            "/{paper_id}/questions/{question_id}/answer",
            post(attempt::submit_answer),
        )
        .route(
            "/{paper_id}/questions/{question_id}/skip",
            post(attempt::skip_question),
        )
        .route(
            "/{paper_id}/questions/{question_id}/options",
            get(attempt::question_options),
        );

    let learner_routes = Router::new()
        .nest("/papers", paper_routes)
        .nest("/attempts", attempt_routes)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let admin_routes = Router::new()
        .route("/questions", post(admin::create_question))
        .route("/questions/{id}/test_cases", post(admin::add_test_case))
        .route("/quizzes", post(admin::create_quiz))
        .route("/papers", post(admin::create_paper))
        .route("/papers/{id}/total_marks", post(admin::update_total_marks))
        .route(
            "/attempts/{paper_id}/questions/{question_id}/regrade",
            post(admin::regrade),
        )
        .route(
            "/attempts/{paper_id}/questions/{question_id}/marks",
            put(admin::set_marks),
        )
        .route("/attempts/{paper_id}/extra_time", post(admin::grant_extra_time))
        // Double middleware protection: Auth first, then Admin check
        .layer(middleware::from_fn(admin_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .nest("/api", learner_routes)
        .nest("/api/admin", admin_routes)
        // Global Middleware (applied from outside in)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
