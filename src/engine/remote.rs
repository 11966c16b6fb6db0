//! Engine that forwards batches to an Ollama-compatible HTTP service.
//!
//! The service has no batch endpoint, so one `/api/generate` call is issued per
//! prompt. Calls run concurrently and results are gathered back in prompt
//! order; the first failure fails the whole batch.

use super::{BatchInput, DeviceMemory, InferenceEngine};
use crate::error::EngineError;
use async_trait::async_trait;
use futures::future::try_join_all;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RemoteEngineConfig {
    /// Base URL of the service, e.g. `http://localhost:11434`
    pub base_url: String,

    /// Per-prompt request timeout
    pub request_timeout: Duration,
}

impl Default for RemoteEngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl RemoteEngineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: usize,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: String,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// HTTP-backed engine.
pub struct RemoteEngine {
    client: Client<HttpConnector>,
    config: RemoteEngineConfig,
}

impl RemoteEngine {
    pub fn new(config: RemoteEngineConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &RemoteEngineConfig {
        &self.config
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.config.base_url.trim_end_matches('/'))
    }

    /// Model names on the service carry the revision as a tag (`name:rev`).
    fn remote_model_name(input: &BatchInput) -> String {
        match &input.model.revision {
            Some(rev) => format!("{}:{}", input.model.name, rev),
            None => input.model.name.clone(),
        }
    }

    async fn generate_one(&self, input: &BatchInput, prompt: &str) -> Result<String, EngineError> {
        let body = GenerateBody {
            model: Self::remote_model_name(input),
            prompt,
            stream: false,
            options: GenerateOptions {
                num_predict: input.max_tokens,
                temperature: input.temperature,
            },
        };
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.generate_url())
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?;

        let response = tokio::time::timeout(self.config.request_timeout, self.client.request(request))
            .await
            .map_err(|_| {
                EngineError::Transport(format!(
                    "request timed out after {:?}",
                    self.config.request_timeout
                ))
            })??;

        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;

        if status == StatusCode::NOT_FOUND {
            return Err(EngineError::Unavailable {
                model: input.model.to_string(),
            });
        }
        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorResponse>(&bytes)
                .map(|e| e.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
            warn!(status = %status, model = %input.model, "remote generate failed");
            return Err(EngineError::Failed(format!("{status}: {message}")));
        }

        let parsed: GenerateResponse = serde_json::from_slice(&bytes)?;
        Ok(parsed.response)
    }
}

#[async_trait]
impl InferenceEngine for RemoteEngine {
    async fn batch_infer(&self, input: BatchInput) -> Result<Vec<String>, EngineError> {
        debug!(
            model = %input.model,
            prompts = input.prompts.len(),
            url = %self.generate_url(),
            "forwarding batch to remote engine"
        );
        try_join_all(
            input
                .prompts
                .iter()
                .map(|prompt| self.generate_one(&input, prompt)),
        )
        .await
    }

    /// The remote service does not expose device memory.
    fn device_stats(&self, _gpu_id: u32) -> Option<DeviceMemory> {
        None
    }

    fn name(&self) -> &str {
        "remote"
    }
}
