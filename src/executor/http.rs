// src/executor/http.rs

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{CodeExecutor, ExecutorError, JobPayload, JobStatus};

#[derive(Debug, Serialize)]
struct SubmitJobRequest<'a> {
    uid: &'a str,
    language: &'a str,
    workdir: &'a str,
    payload: &'a JobPayload,
}

#[derive(Debug, Deserialize)]
struct SubmitJobResponse {
    uid: String,
}

/// JSON-over-HTTP client for the code server pool.
#[derive(Debug, Clone)]
pub struct HttpCodeServer {
    client: Client,
    base_url: String,
}

impl HttpCodeServer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CodeExecutor for HttpCodeServer {
    async fn submit(
        &self,
        language: &str,
        payload: &JobPayload,
        workdir: &str,
    ) -> Result<String, ExecutorError> {
        let uid = uuid::Uuid::new_v4().to_string();

        let response = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .json(&SubmitJobRequest {
                uid: &uid,
                language,
                workdir,
                payload,
            })
            .send()
            .await?
            .error_for_status()?;

        let accepted: SubmitJobResponse = response.json().await?;
        if accepted.uid != uid {
            return Err(ExecutorError::Protocol(format!(
                "submitted job '{}' but server acknowledged '{}'",
                uid, accepted.uid
            )));
        }

        tracing::debug!("Submitted {} job {} for question {}", language, uid, payload.question_id);
        Ok(uid)
    }

    async fn fetch(&self, correlation_id: &str, block: bool) -> Result<JobStatus, ExecutorError> {
        let response = self
            .client
            .get(format!("{}/jobs/{}", self.base_url, correlation_id))
            .query(&[("block", block)])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ExecutorError::UnknownJob(correlation_id.to_string()));
        }

        let status = response.error_for_status()?.json::<JobStatus>().await?;
        Ok(status)
    }
}
