//! AI client error model.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiError {
    /// No API key configured for the selected provider.
    #[error("ai provider not configured")]
    NotConfigured,

    /// Provider answered with a non-success status.
    #[error("provider returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Connection / timeout / body-read failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The provider's reply did not match the expected shape.
    #[error("unparseable response: {0}")]
    Parse(String),
}

impl AiError {
    /// Failures that retrying cannot fix: missing key, bad credentials.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AiError::NotConfigured | AiError::Status { status: 401 | 403, .. }
        )
    }

    /// Rate-limit replies push the backoff schedule one doubling further.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AiError::Status { status: 429, .. })
    }
}

impl From<reqwest::Error> for AiError {
    fn from(err: reqwest::Error) -> Self {
        AiError::Transport(err.to_string())
    }
}
