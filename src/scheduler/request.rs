//! Requests and the model keys that route them.

use super::handle::{completion_pair, CompletionHandle, CompletionSender};
use crate::error::DispatchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

const MAX_TEMPERATURE: f32 = 2.0;

/// Identifies one queue and one batch worker: model name plus optional revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    pub name: String,
    pub revision: Option<String>,
}

impl ModelKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: None,
        }
    }

    pub fn with_revision(name: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: Some(revision.into()),
        }
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.name.trim().is_empty() {
            return Err(DispatchError::validation("model name must not be empty"));
        }
        if let Some(rev) = &self.revision {
            if rev.trim().is_empty() {
                return Err(DispatchError::validation(
                    "model revision must not be empty when given",
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.revision {
            Some(rev) => write!(f, "{}@{}", self.name, rev),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// What the caller wants generated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Prompt(String),
    Chat(Vec<ChatMessage>),
}

impl Payload {
    /// Flatten the payload into the single prompt string the engine consumes.
    pub fn render(&self) -> String {
        match self {
            Payload::Prompt(text) => text.clone(),
            Payload::Chat(messages) => {
                let mut prompt = String::new();
                for message in messages {
                    prompt.push_str(&message.role);
                    prompt.push_str(": ");
                    prompt.push_str(&message.content);
                    prompt.push('\n');
                }
                prompt.push_str("assistant:");
                prompt
            }
        }
    }

    fn validate(&self) -> Result<(), DispatchError> {
        match self {
            Payload::Prompt(text) if text.trim().is_empty() => {
                Err(DispatchError::validation("prompt must not be empty"))
            }
            Payload::Chat(messages) if messages.is_empty() => {
                Err(DispatchError::validation("chat request has no messages"))
            }
            Payload::Chat(messages) => {
                for (i, m) in messages.iter().enumerate() {
                    if m.role.trim().is_empty() {
                        return Err(DispatchError::validation(format!(
                            "message {i} has an empty role"
                        )));
                    }
                    if m.content.trim().is_empty() {
                        return Err(DispatchError::validation(format!(
                            "message {i} has empty content"
                        )));
                    }
                }
                Ok(())
            }
            Payload::Prompt(_) => Ok(()),
        }
    }
}

/// Caller-side description of a generation request, before it is admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub payload: Payload,
    pub max_tokens: usize,
    pub temperature: f32,
    #[serde(default)]
    pub stream: bool,
}

impl GenerationRequest {
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            payload: Payload::Prompt(text.into()),
            max_tokens: 128,
            temperature: 0.7,
            stream: false,
        }
    }

    pub fn chat(messages: Vec<ChatMessage>) -> Self {
        Self {
            payload: Payload::Chat(messages),
            max_tokens: 128,
            temperature: 0.7,
            stream: false,
        }
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    #[must_use]
    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        self.payload.validate()?;
        if self.max_tokens == 0 {
            return Err(DispatchError::validation("max_tokens must be greater than zero"));
        }
        if !self.temperature.is_finite()
            || self.temperature < 0.0
            || self.temperature > MAX_TEMPERATURE
        {
            return Err(DispatchError::validation(format!(
                "temperature must be within [0, {MAX_TEMPERATURE}], got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// A request owned by exactly one queue until a batch worker drains it.
///
/// Carries the resolving half of its completion handle; dropping a request
/// without resolving it resolves the caller's handle with
/// [`DispatchError::Abandoned`].
#[derive(Debug)]
pub struct Request {
    pub id: String,
    pub model_key: ModelKey,
    pub payload: Payload,
    pub max_tokens: usize,
    pub temperature: f32,
    pub stream: bool,
    pub arrival_time: Instant,
    /// Device the load balancer assigned at admission
    pub gpu_id: u32,
    pub(crate) completion: CompletionSender,
}

impl Request {
    pub(crate) fn new(
        model_key: ModelKey,
        generation: GenerationRequest,
        gpu_id: u32,
    ) -> (Self, CompletionHandle) {
        Self::with_id(uuid::Uuid::new_v4().to_string(), model_key, generation, gpu_id)
    }

    pub(crate) fn with_id(
        id: String,
        model_key: ModelKey,
        generation: GenerationRequest,
        gpu_id: u32,
    ) -> (Self, CompletionHandle) {
        let (completion, handle) = completion_pair(id.clone());
        let request = Self {
            id,
            model_key,
            payload: generation.payload,
            max_tokens: generation.max_tokens,
            temperature: generation.temperature,
            stream: generation.stream,
            arrival_time: Instant::now(),
            gpu_id,
            completion,
        };
        (request, handle)
    }

    pub fn prompt(&self) -> String {
        self.payload.render()
    }

    pub fn is_cancelled(&self) -> bool {
        self.completion.is_cancelled()
    }

    /// Resolve the caller's handle. Returns false if it was already resolved.
    pub(crate) fn resolve(&self, result: Result<String, DispatchError>) -> bool {
        self.completion.resolve(result)
    }
}
