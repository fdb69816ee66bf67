//! Provider-pluggable completion client.
//!
//! The provider is text-in / text-out: a system preamble plus one user
//! message, one text answer back. Everything incident-specific lives in
//! [`crate::prompt`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;

use opspulse_resilience::{BreakerError, CircuitBreaker, RetryPolicy};

use crate::error::AiError;

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";

const DEFAULT_CLAUDE_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AiProvider {
    Claude,
    OpenAi,
}

impl AiProvider {
    pub fn default_model(&self) -> &'static str {
        match self {
            AiProvider::Claude => DEFAULT_CLAUDE_MODEL,
            AiProvider::OpenAi => DEFAULT_OPENAI_MODEL,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AiProvider::Claude => "claude",
            AiProvider::OpenAi => "openai",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AiClientConfig {
    pub provider: AiProvider,
    pub api_key: Option<String>,
    /// `None` selects the provider default.
    pub model: Option<String>,
    pub timeout: Duration,
    pub max_tokens: u32,
}

impl Default for AiClientConfig {
    fn default() -> Self {
        Self {
            provider: AiProvider::Claude,
            api_key: None,
            model: None,
            timeout: Duration::from_secs(60),
            max_tokens: 4096,
        }
    }
}

/// One successful completion plus its usage accounting.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency: Duration,
}

/// Breaker-guarded, retrying completion client.
pub struct AiClient {
    config: AiClientConfig,
    model: String,
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl AiClient {
    pub fn new(config: AiClientConfig, breaker: Arc<CircuitBreaker>, retry: RetryPolicy) -> Self {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| config.provider.default_model().to_string());
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self {
            config,
            model,
            http,
            breaker,
            retry,
        }
    }

    pub fn provider(&self) -> AiProvider {
        self.config.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Whether an API key is present at all.
    pub fn configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    /// Whether a call would be attempted: key present and breaker willing.
    pub fn available(&self) -> bool {
        self.configured() && self.breaker.can_execute()
    }

    /// One guarded completion: retries inside the breaker, one breaker
    /// outcome per call sequence.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
    ) -> Result<Completion, BreakerError<AiError>> {
        let completion = self
            .breaker
            .execute(|| self.complete_with_retry(system, user))
            .await?;
        tracing::info!(
            provider = self.config.provider.as_str(),
            model = %self.model,
            latency_ms = completion.latency.as_millis() as u64,
            input_tokens = completion.input_tokens,
            output_tokens = completion.output_tokens,
            "ai completion succeeded"
        );
        Ok(completion)
    }

    async fn complete_with_retry(&self, system: &str, user: &str) -> Result<Completion, AiError> {
        let mut extra_doublings = 0u32;
        let mut last_err = AiError::NotConfigured;

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay(attempt - 1, extra_doublings)).await;
            }
            match self.call_once(system, user).await {
                Ok(completion) => return Ok(completion),
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => {
                    if err.is_rate_limited() {
                        extra_doublings = 1;
                    }
                    tracing::warn!(
                        attempt,
                        max = self.retry.max_retries,
                        %err,
                        "ai call failed"
                    );
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn call_once(&self, system: &str, user: &str) -> Result<Completion, AiError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(AiError::NotConfigured);
        };
        let started = Instant::now();
        match self.config.provider {
            AiProvider::Claude => self.call_claude(api_key, system, user, started).await,
            AiProvider::OpenAi => self.call_openai(api_key, system, user, started).await,
        }
    }

    async fn call_claude(
        &self,
        api_key: &str,
        system: &str,
        user: &str,
        started: Instant,
    ) -> Result<Completion, AiError> {
        let response = self
            .http
            .post(ANTHROPIC_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&serde_json::json!({
                "model": &self.model,
                "max_tokens": self.config.max_tokens,
                "system": system,
                "messages": [{"role": "user", "content": user}],
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        #[derive(Deserialize)]
        struct ContentBlock {
            text: Option<String>,
        }
        #[derive(Deserialize, Default)]
        struct Usage {
            #[serde(default)]
            input_tokens: u64,
            #[serde(default)]
            output_tokens: u64,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            content: Vec<ContentBlock>,
            #[serde(default)]
            usage: Option<Usage>,
        }

        let body: ApiResponse = response.json().await?;
        let text = body
            .content
            .first()
            .and_then(|block| block.text.clone())
            .ok_or_else(|| AiError::Parse("empty content array".to_string()))?;
        let usage = body.usage.unwrap_or_default();

        Ok(Completion {
            text,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            latency: started.elapsed(),
        })
    }

    async fn call_openai(
        &self,
        api_key: &str,
        system: &str,
        user: &str,
        started: Instant,
    ) -> Result<Completion, AiError> {
        let response = self
            .http
            .post(OPENAI_URL)
            .bearer_auth(api_key)
            .json(&serde_json::json!({
                "model": &self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        #[derive(Deserialize)]
        struct Message {
            content: Option<String>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize, Default)]
        struct Usage {
            #[serde(default)]
            prompt_tokens: u64,
            #[serde(default)]
            completion_tokens: u64,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            choices: Vec<Choice>,
            #[serde(default)]
            usage: Option<Usage>,
        }

        let body: ApiResponse = response.json().await?;
        let text = body
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| AiError::Parse("empty choices array".to_string()))?;
        let usage = body.usage.unwrap_or_default();

        Ok(Completion {
            text,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            latency: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opspulse_resilience::BreakerConfig;

    fn client(api_key: Option<&str>) -> AiClient {
        AiClient::new(
            AiClientConfig {
                api_key: api_key.map(|k| k.to_string()),
                ..Default::default()
            },
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            RetryPolicy::default(),
        )
    }

    #[test]
    fn defaults_to_provider_model() {
        let c = client(Some("key"));
        assert_eq!(c.model(), DEFAULT_CLAUDE_MODEL);
        assert_eq!(c.provider(), AiProvider::Claude);
    }

    #[test]
    fn unavailable_without_api_key() {
        assert!(!client(None).available());
        assert!(client(Some("key")).available());
    }

    #[test]
    fn open_breaker_makes_client_unavailable() {
        let c = client(Some("key"));
        c.breaker().trip();
        assert!(!c.available());
    }

    #[tokio::test]
    async fn missing_key_fails_without_touching_network() {
        let c = client(None);
        let result = c.complete("system", "user").await;
        assert!(matches!(
            result,
            Err(BreakerError::Inner(AiError::NotConfigured))
        ));
    }

    #[test]
    fn terminal_and_rate_limit_classification() {
        let unauthorized = AiError::Status {
            status: 401,
            message: String::new(),
        };
        assert!(unauthorized.is_terminal());
        let throttled = AiError::Status {
            status: 429,
            message: String::new(),
        };
        assert!(!throttled.is_terminal());
        assert!(throttled.is_rate_limited());
    }
}
