use anyhow::{Context, Result};
use async_trait::async_trait;
use gemini_client::GeminiClient;
use gemini_client::types::GenerateContentRequest;
use lingo_core::evaluator::LanguageModel;
use secrecy::SecretString;

/// Sampling temperature for every call. Low enough to keep the JSON shape
/// stable, high enough for varied questions.
const TEMPERATURE: f32 = 0.7;

/// The slice of `GeminiClient` the adapter relies on, so the client can be
/// mocked in tests.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate_text(&self, request: &GenerateContentRequest) -> Result<String>;
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate_text(&self, request: &GenerateContentRequest) -> Result<String> {
        GeminiClient::generate_text(self, request).await
    }
}

/// An adapter that implements `LanguageModel` on top of the Gemini REST client.
pub struct GeminiAdapter<C: TextGenerator> {
    client: C,
}

impl GeminiAdapter<GeminiClient> {
    pub fn new(api_key: SecretString, model: &str) -> Self {
        Self {
            client: gemini_client::connect(api_key, model),
        }
    }
}

fn build_request(prompt: &str) -> GenerateContentRequest {
    GenerateContentRequest::from_prompt(prompt)
        .with_temperature(TEMPERATURE)
        .with_json_output()
}

#[async_trait]
impl<C: TextGenerator> LanguageModel for GeminiAdapter<C> {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = build_request(prompt);
        let text = self
            .client
            .generate_text(&request)
            .await
            .context("Gemini generation failed")?;
        tracing::debug!("Gemini replied with {} bytes", text.len());
        Ok(text)
    }
}
