//! HTTP adapter for OpenAI-compatible chat-completion endpoints.
//!
//! Implements `relay-core`'s `CompletionTransport`: one POST per call, with the
//! outcome classified for the core retry loop.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use relay_core::{
    config::Config,
    errors::Error,
    model::{
        client::CompletionTransport,
        types::{AttemptError, ChatCompletionRequest},
    },
    Result,
};

#[derive(Clone, Debug)]
pub struct HttpCompletionTransport {
    api_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpCompletionTransport {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Self::with_builder(
            api_url,
            api_key,
            reqwest::Client::builder().timeout(timeout),
        )
    }

    /// Build from config, honoring the optional extra root certificate.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(cfg.request_timeout);
        if let Some(path) = &cfg.ca_cert_path {
            let pem = std::fs::read(path).map_err(|e| {
                Error::Config(format!("failed to read CA cert {}: {e}", path.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                Error::Config(format!("invalid CA cert {}: {e}", path.display()))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        Self::with_builder(cfg.api_url.clone(), cfg.api_key.clone(), builder)
    }

    fn with_builder(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        builder: reqwest::ClientBuilder,
    ) -> Result<Self> {
        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("http client build failed: {e}")))?;
        Ok(Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            http,
        })
    }
}

#[async_trait]
impl CompletionTransport for HttpCompletionTransport {
    async fn send(
        &self,
        body: &ChatCompletionRequest,
    ) -> std::result::Result<serde_json::Value, AttemptError> {
        let resp = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AttemptError::Network(format!("completion request error: {e}")))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::Throttled);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(%status, "completion request rejected");
            return Err(AttemptError::Provider(format!(
                "{status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| AttemptError::Provider(format!("completion json error: {e}")))
    }
}
