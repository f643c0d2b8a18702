use async_trait::async_trait;
use serde_json::json;

use crate::config::LlmConfig;
use crate::llm::{AdapterError, AnalysisProvider, Prompt, send_json};

pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl GeminiProvider {
    pub fn new(client: reqwest::Client, config: &LlmConfig) -> Result<Self, AdapterError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AdapterError::Unavailable("gemini requires DBLENS_LLM_API_KEY".into()))?;
        Ok(Self {
            client,
            base_url: config.endpoint(),
            api_key,
            model: config.model_name(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl AnalysisProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, AdapterError> {
        let url = format!("{}/{}:generateContent", self.base_url, self.model);
        let mut generation = json!({ "temperature": self.temperature });
        if !prompt.expects_reasoning {
            generation["responseMimeType"] = json!("application/json");
        }
        let body = json!({
            "systemInstruction": { "parts": [{ "text": prompt.system }] },
            "contents": [{ "role": "user", "parts": [{ "text": prompt.user }] }],
            "generationConfig": generation,
        });

        let request = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body);
        let json = send_json(request).await?;

        json["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                AdapterError::InvalidResponse("missing candidates[0].content.parts[0].text".into())
            })
    }
}
