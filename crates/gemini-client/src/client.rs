use crate::types::{GenerateContentRequest, GenerateContentResponse};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};

pub const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// A client for the Gemini `generateContent` REST endpoint.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

/// Creates a client for `model` authenticated with `api_key`.
pub fn connect(api_key: SecretString, model: &str) -> GeminiClient {
    tracing::info!("Using Gemini model {}", model);
    GeminiClient {
        http: reqwest::Client::new(),
        base_url: BASE_URL.to_string(),
        api_key,
        model: model.to_string(),
    }
}

impl GeminiClient {
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sends a single request and returns the decoded response.
    pub async fn generate_content(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let resp = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.expose_secret())])
            .json(request)
            .send()
            .await
            .context("Failed to reach Gemini")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Gemini returned {}: {}", status, body));
        }

        resp.json::<GenerateContentResponse>()
            .await
            .context("Failed to decode Gemini response")
    }

    /// Convenience wrapper returning the text of the first candidate.
    pub async fn generate_text(&self, request: &GenerateContentRequest) -> Result<String> {
        let resp = self.generate_content(request).await?;
        if let Some(reason) = resp
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
        {
            tracing::warn!("Gemini blocked the prompt: {}", reason);
        }
        resp.text()
            .ok_or_else(|| anyhow::anyhow!("Gemini response contained no text"))
    }
}
