// tests/api_tests.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{body::Body, http::Request};
use chrono::Utc;
use exam_engine::{
    config::Config,
    engine::{ManualClock, QuizEngine},
    executor::{CodeExecutor, ExecutorError, JobPayload, JobStatus},
    routes,
    state::AppState,
    store::MemoryStore,
    utils::jwt::{STAFF_ROLE, sign_jwt},
};
use serde_json::{Value, json};
use tower::ServiceExt;

const SECRET: &str = "test_secret_for_integration_tests";

/// These tests only use questions graded in-process.
struct OfflineRunner;

#[async_trait]
impl CodeExecutor for OfflineRunner {
    async fn submit(&self, _: &str, _: &JobPayload, _: &str) -> Result<String, ExecutorError> {
        Err(ExecutorError::Protocol("no code server in tests".to_string()))
    }

    async fn fetch(&self, id: &str, _: bool) -> Result<JobStatus, ExecutorError> {
        Err(ExecutorError::UnknownJob(id.to_string()))
    }
}

fn test_config() -> Config {
    Config {
        database_url: "postgres://unused".to_string(),
        jwt_secret: SECRET.to_string(),
        rust_log: "error".to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        code_server_url: "http://127.0.0.1:9".to_string(),
        code_server_timeout: Duration::from_secs(1),
        code_workdir_root: "output".to_string(),
    }
}

fn state_with(engine: QuizEngine, config: Config) -> AppState {
    AppState {
        engine: Arc::new(engine.with_regrade_timeout(config.code_server_timeout)),
        config,
    }
}

fn test_state() -> AppState {
    let engine = QuizEngine::new(Arc::new(MemoryStore::new()), Arc::new(OfflineRunner));
    state_with(engine, test_config())
}

/// Quizzes default to opening at creation, so `clock` should not lag the wall clock.
fn test_state_at(clock: Arc<ManualClock>) -> AppState {
    let engine = QuizEngine::new(Arc::new(MemoryStore::new()), Arc::new(OfflineRunner)).with_clock(clock);
    state_with(engine, test_config())
}

/// Helper function to spawn the app on a random port for testing.
/// Returns the base URL (e.g., "http://127.0.0.1:12345").
async fn spawn_app() -> String {
    spawn_app_with(test_state()).await
}

async fn spawn_app_with(state: AppState) -> String {
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();
    let address = format!("http://127.0.0.1:{}", port);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    address
}

fn learner_token(user_id: i64) -> String {
    sign_jwt(user_id, "user", SECRET, 600).unwrap()
}

fn staff_token() -> String {
    sign_jwt(1, STAFF_ROLE, SECRET, 600).unwrap()
}

/// Authors a one-question integer quiz and returns the question paper and question ids.
async fn author_quiz(client: &reqwest::Client, address: &str, attempts_allowed: i32) -> (i64, i64) {
    let admin = staff_token();

    let question: Value = client
        .post(format!("{}/api/admin/questions", address))
        .bearer_auth(&admin)
        .json(&json!({
            "summary": "Answer to everything",
            "description": "Enter the answer.",
            "points": 1.0,
            "language": "python",
            "type": "integer"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let question_id = question["id"].as_i64().unwrap();

    let test_case = client
        .post(format!("{}/api/admin/questions/{}/test_cases", address, question_id))
        .bearer_auth(&admin)
        .json(&json!({ "test_case_type": "integer", "correct": 42 }))
        .send()
        .await
        .unwrap();
    assert_eq!(test_case.status().as_u16(), 201);

    let quiz: Value = client
        .post(format!("{}/api/admin/quizzes", address))
        .bearer_auth(&admin)
        .json(&json!({
            "description": "Warm-up",
            "duration_minutes": 20,
            "attempts_allowed": attempts_allowed
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let paper: Value = client
        .post(format!("{}/api/admin/papers", address))
        .bearer_auth(&admin)
        .json(&json!({
            "quiz_id": quiz["id"],
            "fixed_questions": [question_id]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let paper_id = paper["id"].as_i64().unwrap();

    let total: Value = client
        .post(format!("{}/api/admin/papers/{}/total_marks", address, paper_id))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(total["total_marks"], 1.0);

    (paper_id, question_id)
}

#[tokio::test]
async fn health_check_404() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/random_path_that_does_not_exist", address))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn requests_without_token_are_rejected() {
    let app = routes::create_router(test_state());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/attempts/1/current")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn learners_cannot_author() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/admin/quizzes", address))
        .bearer_auth(learner_token(5))
        .json(&json!({ "description": "Sneaky", "duration_minutes": 5 }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 403);
}

#[tokio::test]
async fn attempt_flow_over_http() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();
    let (paper_id, question_id) = author_quiz(&client, &address, 1).await;
    let learner = learner_token(7);

    let start = client
        .post(format!("{}/api/papers/{}/start", address, paper_id))
        .bearer_auth(&learner)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(start.status().as_u16(), 201);
    let attempt: Value = start.json().await.unwrap();
    let attempt_id = attempt["id"].as_i64().unwrap();
    assert_eq!(attempt["status"], "inprogress");

    let resumed = client
        .post(format!("{}/api/papers/{}/start", address, paper_id))
        .bearer_auth(&learner)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resumed.status().as_u16(), 200);
    let resumed: Value = resumed.json().await.unwrap();
    assert_eq!(resumed["id"].as_i64(), Some(attempt_id));

    let current: Value = client
        .get(format!("{}/api/attempts/{}/current", address, attempt_id))
        .bearer_auth(&learner)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(current["status"], "question");
    assert_eq!(current["question"]["id"].as_i64(), Some(question_id));

    let answer: Value = client
        .post(format!(
            "{}/api/attempts/{}/questions/{}/answer",
            address, attempt_id, question_id
        ))
        .bearer_auth(&learner)
        .json(&json!({ "value": { "integer": 42 } }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(answer["success"], true);
    assert_eq!(answer["next_question"]["status"], "no_more_questions");

    let score: Value = client
        .post(format!("{}/api/attempts/{}/finalize", address, attempt_id))
        .bearer_auth(&learner)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(score["percent"], 100.0);
    assert_eq!(score["passed"], true);

    let again = client
        .post(format!("{}/api/papers/{}/start", address, paper_id))
        .bearer_auth(&learner)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status().as_u16(), 403);
    let body: Value = again.json().await.unwrap();
    assert_eq!(body["refused"]["reason"], "attempts_exhausted");
    assert_eq!(body["refused"]["allowed"], 1);
}

#[tokio::test]
async fn attempts_are_private_to_their_learner() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();
    let (paper_id, _) = author_quiz(&client, &address, -1).await;

    let attempt: Value = client
        .post(format!("{}/api/papers/{}/start", address, paper_id))
        .bearer_auth(learner_token(7))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let attempt_id = attempt["id"].as_i64().unwrap();

    let foreign = client
        .get(format!("{}/api/attempts/{}", address, attempt_id))
        .bearer_auth(learner_token(8))
        .send()
        .await
        .unwrap();
    assert_eq!(foreign.status().as_u16(), 403);

    let staff: Value = client
        .get(format!("{}/api/attempts/{}", address, attempt_id))
        .bearer_auth(staff_token())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(staff["questions_left"], 1);
    assert!(staff["time_left_secs"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn malformed_answers_are_bad_requests() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();
    let (paper_id, question_id) = author_quiz(&client, &address, 1).await;
    let learner = learner_token(9);

    let attempt: Value = client
        .post(format!("{}/api/papers/{}/start", address, paper_id))
        .bearer_auth(&learner)
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let response = client
        .post(format!(
            "{}/api/attempts/{}/questions/{}/answer",
            address, attempt["id"], question_id
        ))
        .bearer_auth(&learner)
        .json(&json!({ "value": { "text": "forty-two" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn mcq_takes_a_single_correct_option() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();
    let admin = staff_token();

    let question: Value = client
        .post(format!("{}/api/admin/questions", address))
        .bearer_auth(&admin)
        .json(&json!({
            "summary": "Pick the prime",
            "description": "Choose one.",
            "points": 1.0,
            "language": "python",
            "type": "mcq"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let url = format!("{}/api/admin/questions/{}/test_cases", address, question["id"]);

    for (option, expected) in [("7", 201), ("9", 201), ("11", 400)] {
        let response = client
            .post(&url)
            .bearer_auth(&admin)
            .json(&json!({
                "test_case_type": "mcq",
                "options": option,
                "correct": option != "9"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), expected, "option {}", option);
    }
}

#[tokio::test]
async fn expired_attempt_reads_as_completed() {
    let clock = Arc::new(ManualClock::new(Utc::now() + chrono::Duration::minutes(1)));
    let address = spawn_app_with(test_state_at(clock.clone())).await;
    let client = reqwest::Client::new();
    let (paper_id, _) = author_quiz(&client, &address, 1).await;
    let learner = learner_token(11);

    let attempt: Value = client
        .post(format!("{}/api/papers/{}/start", address, paper_id))
        .bearer_auth(&learner)
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    clock.advance(chrono::Duration::minutes(21));

    let view: Value = client
        .get(format!("{}/api/attempts/{}", address, attempt["id"]))
        .bearer_auth(&learner)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["paper"]["status"], "completed");
    assert_eq!(view["paper"]["percent"], 0.0);
    assert_eq!(view["time_left_secs"], 0);
}
