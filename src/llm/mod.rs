//! Optional LLM enrichment.
//!
//! A provider turns a [`Prompt`] into raw text. The adapter owns everything
//! around that call: the time limit, response parsing and validation against
//! the sanitized context. Every failure is an [`AdapterError`] so the caller
//! can fall back to heuristic results.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::config::{LlmConfig, LlmProviderKind};
use crate::recommendations::{Recommendation, SkipReason};

mod context;
mod gemini;
mod ollama;
mod openai;
mod prompt;
mod response;

pub use context::{AnalysisContext, ColumnSummary, DigestSummary, IndexSummary, TableSummary};
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use prompt::{Prompt, is_reasoning_model};
pub use response::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("provider error: {0}")]
    Backend(String),
}

impl AdapterError {
    pub fn skip_reason(&self) -> SkipReason {
        match self {
            AdapterError::Timeout(_) => SkipReason::Timeout,
            AdapterError::Unavailable(_) => SkipReason::Unavailable,
            AdapterError::InvalidResponse(_) => SkipReason::InvalidResponse,
            AdapterError::Backend(_) => SkipReason::BackendError,
        }
    }
}

/// A text-completion backend.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn complete(&self, prompt: &Prompt) -> Result<String, AdapterError>;
}

/// Construct the provider selected by `llm.provider`.
pub fn build_provider(config: &LlmConfig) -> Result<Arc<dyn AnalysisProvider>, AdapterError> {
    let client = http_client(config.timeout)?;
    let provider: Arc<dyn AnalysisProvider> = match config.provider {
        LlmProviderKind::OpenAi | LlmProviderKind::DeepSeek | LlmProviderKind::OpenAiCompatible => {
            Arc::new(OpenAiProvider::new(client, config))
        }
        LlmProviderKind::Ollama => Arc::new(OllamaProvider::new(client, config)),
        LlmProviderKind::Gemini => Arc::new(GeminiProvider::new(client, config)?),
    };
    info!(
        provider = provider.name(),
        model = provider.model(),
        "llm provider configured"
    );
    Ok(provider)
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, AdapterError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| AdapterError::Unavailable(err.to_string()))
}

/// Send a JSON request and decode the JSON body, mapping transport and status
/// failures onto [`AdapterError`].
async fn send_json(request: reqwest::RequestBuilder) -> Result<serde_json::Value, AdapterError> {
    let response = request.send().await.map_err(from_reqwest)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = format!("{status}: {}", truncate(&body, 300));
        return Err(if status.is_server_error() || status.as_u16() == 429 {
            AdapterError::Unavailable(message)
        } else {
            AdapterError::Backend(message)
        });
    }
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|err| AdapterError::InvalidResponse(err.to_string()))
}

fn from_reqwest(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Unavailable(format!("request timed out: {err}"))
    } else if err.is_decode() {
        AdapterError::InvalidResponse(err.to_string())
    } else {
        AdapterError::Unavailable(err.to_string())
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Bounded, validated access to one provider.
#[derive(Clone)]
pub struct LlmAdapter {
    provider: Arc<dyn AnalysisProvider>,
    timeout: Duration,
    max_digests: usize,
}

impl LlmAdapter {
    pub fn new(provider: Arc<dyn AnalysisProvider>, timeout: Duration, max_digests: usize) -> Self {
        Self {
            provider,
            timeout,
            max_digests,
        }
    }

    /// `None` when enrichment is disabled.
    pub fn from_config(config: &LlmConfig) -> Result<Option<Self>, AdapterError> {
        if !config.enabled {
            return Ok(None);
        }
        let provider = build_provider(config)?;
        Ok(Some(Self::new(provider, config.timeout, config.max_digests)))
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn max_digests(&self) -> usize {
        self.max_digests
    }

    /// Ask the provider for recommendations about `context`.
    ///
    /// The whole response is rejected when it does not match the response
    /// schema. Individual items that reference unknown tables or columns are
    /// kept only as zero-confidence advisories.
    #[instrument(skip_all, fields(provider = self.provider.name()))]
    pub async fn analyze(
        &self,
        context: &AnalysisContext,
    ) -> Result<Vec<Recommendation>, AdapterError> {
        let prompt = prompt::build(context, self.provider.model())?;
        let raw = tokio::time::timeout(self.timeout, self.provider.complete(&prompt))
            .await
            .map_err(|_| AdapterError::Timeout(self.timeout))??;
        debug!(bytes = raw.len(), "provider answered");

        let items = response::parse(&raw)?;
        let recommendations = response::into_recommendations(items, context);
        info!(candidates = recommendations.len(), "llm analysis complete");
        Ok(recommendations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_reasons_follow_error_kind() {
        assert_eq!(
            AdapterError::Timeout(Duration::from_secs(1)).skip_reason(),
            SkipReason::Timeout
        );
        assert_eq!(
            AdapterError::InvalidResponse("x".into()).skip_reason(),
            SkipReason::InvalidResponse
        );
        assert_eq!(
            AdapterError::Backend("x".into()).skip_reason(),
            SkipReason::BackendError
        );
    }

    #[test]
    fn disabled_config_builds_no_adapter() {
        let config = LlmConfig::default();
        assert!(LlmAdapter::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ab", 10), "ab");
    }
}
