use async_trait::async_trait;
use serde_json::json;

use crate::config::LlmConfig;
use crate::llm::{AdapterError, AnalysisProvider, Prompt, send_json};

/// Local models served by Ollama's `/api/generate`.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OllamaProvider {
    pub fn new(client: reqwest::Client, config: &LlmConfig) -> Self {
        Self {
            client,
            base_url: config.endpoint(),
            model: config.model_name(),
            temperature: config.temperature,
        }
    }
}

#[async_trait]
impl AnalysisProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, AdapterError> {
        let url = format!("{}/api/generate", self.base_url);
        let mut body = json!({
            "model": self.model,
            "prompt": prompt.combined(),
            "stream": false,
            "options": { "temperature": self.temperature },
        });
        // JSON mode suppresses the thinking block reasoning models rely on.
        if !prompt.expects_reasoning {
            body["format"] = json!("json");
        }

        let json = send_json(self.client.post(&url).json(&body)).await?;
        json["response"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AdapterError::InvalidResponse("missing response field".into()))
    }
}
