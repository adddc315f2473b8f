use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::error::{HarnessError, Result};

/// Turns a finished prompt into the model's raw answer.
#[allow(async_fn_in_trait)]
pub trait ActionGenerator {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Client for the hosted text-generation model.
pub struct GenerationClient {
    client: Client,
    url: String,
    api_token: Option<String>,
    max_new_tokens: u32,
    pad_token_id: u32,
}

#[derive(Deserialize)]
struct Generated {
    generated_text: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GenerationResponse {
    Batch(Vec<Generated>),
    Single(Generated),
}

impl GenerationClient {
    pub fn new(url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            api_token,
            max_new_tokens: 256,
            pad_token_id: 2,
        }
    }

    pub fn with_limits(mut self, max_new_tokens: u32, pad_token_id: u32) -> Self {
        self.max_new_tokens = max_new_tokens;
        self.pad_token_id = pad_token_id;
        self
    }
}

impl ActionGenerator for GenerationClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Accept", "application/json")
            .json(&json!({
                "inputs": prompt,
                "parameters": {
                    "max_new_tokens": self.max_new_tokens,
                    "return_full_text": false,
                    "pad_token_id": self.pad_token_id,
                }
            }));
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        debug!(prompt_chars = prompt.len(), "querying action model");
        let response = request
            .send()
            .await
            .map_err(|e| HarnessError::GenerationService(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HarnessError::GenerationService(format!("{status}: {body}")));
        }

        let parsed = response
            .json::<GenerationResponse>()
            .await
            .map_err(|e| HarnessError::GenerationService(format!("unreadable response: {e}")))?;
        let text = match parsed {
            GenerationResponse::Batch(batch) => batch
                .into_iter()
                .next()
                .map(|g| g.generated_text)
                .ok_or_else(|| HarnessError::GenerationService("empty generation batch".into()))?,
            GenerationResponse::Single(g) => g.generated_text,
        };

        info!(answer = %text, "model replied");
        Ok(text)
    }
}
