//! OpenAI-compatible chat-completions producer.
//!
//! Talks to a locally hosted model server (LM Studio style). The request
//! timeout is tiered by a coarse complexity score over the instruction and
//! context, since large multi-file generations legitimately take far longer
//! than simple requests. All transport failures map to
//! [`StagegateError::ProducerUnavailable`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::{Result, StagegateError};
use crate::retry::CandidateProducer;

const TIMEOUT_SIMPLE: Duration = Duration::from_secs(120);
const TIMEOUT_COMPLEX: Duration = Duration::from_secs(600);
const TIMEOUT_MASSIVE: Duration = Duration::from_secs(900);

const COMPLEX_KEYWORDS: [&str; 8] = [
    "refactor",
    "implement",
    "create system",
    "build application",
    "full project",
    "multiple files",
    "complex",
    "advanced",
];

/// Chat-completions client implementing [`CandidateProducer`].
#[derive(Debug, Clone)]
pub struct HttpChatProducer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    system_prompt: String,
}

impl HttpChatProducer {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            system_prompt: "You are a careful assistant that generates safe, well-tested \
                            code. Always provide working code with proper error handling \
                            and include test cases."
                .to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

/// Pick a request timeout tier from instruction length, context size and
/// complexity keywords.
pub fn request_timeout(instruction: &str, context: &BTreeMap<String, String>) -> Duration {
    let mut score = 0u32;

    if instruction.len() > 1000 {
        score += 2;
    } else if instruction.len() > 500 {
        score += 1;
    }

    if context.len() > 3 {
        score += 2;
    } else if context.len() > 1 {
        score += 1;
    }

    let lowered = instruction.to_lowercase();
    if COMPLEX_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score += 2;
    }

    match score {
        0..=1 => TIMEOUT_SIMPLE,
        2..=3 => TIMEOUT_COMPLEX,
        _ => TIMEOUT_MASSIVE,
    }
}

#[async_trait]
impl CandidateProducer for HttpChatProducer {
    async fn produce(
        &self,
        instruction: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<String> {
        let timeout = request_timeout(instruction, context);
        debug!(timeout_secs = timeout.as_secs(), "sending producer request");

        let mut messages = vec![
            json!({ "role": "system", "content": self.system_prompt }),
            json!({ "role": "user", "content": instruction }),
        ];
        for (path, content) in context {
            messages.push(json!({
                "role": "user",
                "content": format!("Here is the current content of {path}:\n{content}"),
            }));
        }

        let payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.7,
            "max_tokens": 2000,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StagegateError::ProducerUnavailable(format!(
                        "producer request timed out after {timeout:?}"
                    ))
                } else {
                    StagegateError::ProducerUnavailable(format!("cannot reach producer: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(StagegateError::ProducerUnavailable(format!(
                "producer returned status {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| StagegateError::ProducerUnavailable(format!("invalid producer body: {e}")))?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                StagegateError::MalformedResponse(
                    "producer body missing choices[0].message.content".to_string(),
                )
            })
    }
}
