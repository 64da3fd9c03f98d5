use anyhow::{Context, Result};
use async_trait::async_trait;
use lingo_core::evaluator::LanguageModel;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub content: Option<String>,
}

/// `LanguageModel` backed by the OpenAI chat completions endpoint.
pub struct OpenAIAdapter {
    client: Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl OpenAIAdapter {
    pub fn new(api_key: SecretString, model: &str) -> Self {
        tracing::info!("Using OpenAI model {}", model);
        Self {
            client: Client::new(),
            api_key,
            model: model.to_string(),
            base_url: OPENAI_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn request_body(&self, prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [
                {
                    "role": "user",
                    "content": prompt
                }
            ],
            "response_format": { "type": "json_object" }
        })
    }
}

fn first_answer(resp: LlmResponse) -> Result<String> {
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
}

#[async_trait]
impl LanguageModel for OpenAIAdapter {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = self.request_body(prompt);

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .context("Failed to reach OpenAI")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("OpenAI returned {}: {}", status, text));
        }

        let resp = resp
            .json::<LlmResponse>()
            .await
            .context("Failed to decode OpenAI response")?;
        first_answer(resp)
    }
}
