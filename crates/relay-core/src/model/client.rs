use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::{
    conversation::Turn,
    domain::ImagePayload,
    errors::Error,
    formatting::completion_text,
    Result,
};

use super::{
    retry::{JitterSource, RandJitter, RetryNotice, RetryObserver, RetryPolicy},
    types::{build_messages, AttemptError, ChatCompletionRequest, CompletionSettings},
};

/// One HTTP exchange with the completion provider.
///
/// Implementations classify the outcome; retrying is the client's job.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn send(
        &self,
        body: &ChatCompletionRequest,
    ) -> std::result::Result<serde_json::Value, AttemptError>;
}

/// Completion client with backoff on throttling.
pub struct CompletionClient {
    transport: Arc<dyn CompletionTransport>,
    settings: CompletionSettings,
    policy: RetryPolicy,
    jitter: Arc<dyn JitterSource>,
}

impl CompletionClient {
    pub fn new(
        transport: Arc<dyn CompletionTransport>,
        settings: CompletionSettings,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            settings,
            policy,
            jitter: Arc::new(RandJitter),
        }
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Send `context` + the new user turn and return the provider payload.
    ///
    /// The payload is guaranteed to carry `choices[0].message.content`.
    pub async fn complete(
        &self,
        context: &[Turn],
        user_text: &str,
        image: Option<&ImagePayload>,
        observer: Option<&dyn RetryObserver>,
    ) -> Result<serde_json::Value> {
        let body = ChatCompletionRequest {
            model: self.settings.model.clone(),
            messages: build_messages(context, user_text, image),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };

        let mut attempt = 1u32;
        loop {
            match self.transport.send(&body).await {
                Ok(payload) => {
                    if completion_text(&payload).is_none() {
                        return Err(Error::Provider(
                            "response is missing choices[0].message.content".to_string(),
                        ));
                    }
                    return Ok(payload);
                }
                Err(AttemptError::Throttled) => {
                    let wait = RetryPolicy::jittered(
                        self.policy.delay_before(attempt + 1),
                        self.jitter.fraction(),
                    );
                    if attempt >= self.policy.max_attempts {
                        tracing::warn!(attempts = attempt, "completion throttled, giving up");
                        return Err(Error::Throttled {
                            attempts: attempt,
                            last_wait: wait,
                        });
                    }

                    tracing::info!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        "completion throttled, backing off"
                    );
                    if let Some(obs) = observer {
                        obs.on_retry(RetryNotice {
                            attempt,
                            max_attempts: self.policy.max_attempts,
                            wait,
                        })
                        .await;
                    }
                    sleep(wait).await;
                    attempt += 1;
                }
                Err(AttemptError::Provider(msg)) => return Err(Error::Provider(msg)),
                Err(AttemptError::Network(msg)) => return Err(Error::Network(msg)),
            }
        }
    }
}
