use async_trait::async_trait;
use serde_json::json;

use crate::config::{LlmConfig, LlmProviderKind};
use crate::llm::{AdapterError, AnalysisProvider, Prompt, send_json};

/// Chat-completions client for OpenAI, DeepSeek and any server that speaks
/// the same API (vLLM, LM Studio, llama.cpp).
pub struct OpenAiProvider {
    client: reqwest::Client,
    name: &'static str,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, config: &LlmConfig) -> Self {
        let name = match config.provider {
            LlmProviderKind::DeepSeek => "deepseek",
            LlmProviderKind::OpenAiCompatible => "openai_compatible",
            _ => "openai",
        };
        Self {
            client,
            name,
            base_url: config.endpoint(),
            api_key: config.api_key.clone(),
            model: config.model_name(),
            temperature: config.temperature,
        }
    }
}

#[async_trait]
impl AnalysisProvider for OpenAiProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, AdapterError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
            "temperature": self.temperature,
        });
        if !prompt.expects_reasoning {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let json = send_json(request).await?;

        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                AdapterError::InvalidResponse("missing choices[0].message.content".into())
            })
    }
}
