// src/executor/mod.rs

//! Contract with the external code execution service.
//!
//! The engine only submits self-contained jobs and fetches their results by
//! correlation id. Sandboxing and runner selection are the service's business.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::question::TestCaseKind;

pub use http::HttpCodeServer;

/// Everything the runner needs to check one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub question_id: i64,
    pub submitted_source: String,
    pub reference_assertions: Vec<TestCaseKind>,
    pub positional_args: Vec<Value>,
    pub keyword_args: Map<String, Value>,
    pub ref_code_path: Option<String>,
    pub partial_grading: bool,
}

/// Verdict reported by the runner for a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,

    /// Sum of the weights of the assertions that passed.
    #[serde(default)]
    pub weight: f64,

    #[serde(default)]
    pub error: Vec<String>,
}

/// State of a submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum JobStatus {
    NotStarted,
    Running,
    Done(ExecutionResult),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("code server unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("code server does not know job '{0}'")]
    UnknownJob(String),

    #[error("code server protocol error: {0}")]
    Protocol(String),
}

/// The code execution service as seen by the grading engine.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Queues a job and returns its correlation id without waiting for it to run.
    async fn submit(
        &self,
        language: &str,
        payload: &JobPayload,
        workdir: &str,
    ) -> Result<String, ExecutorError>;

    /// Reads the job state. With `block` the service may hold the request
    /// until the job finishes; callers bound the wait themselves.
    async fn fetch(&self, correlation_id: &str, block: bool) -> Result<JobStatus, ExecutorError>;
}
