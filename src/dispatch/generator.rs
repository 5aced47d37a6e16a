//! External text-generation backend.
//!
//! The dispatcher only sees the `TextGenerator` trait: a prompt plus a JSON
//! schema goes in, raw response text comes out. `GeminiGenerator` talks to the
//! Gemini `generateContent` REST endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Status(u16),
    #[error("Empty response")]
    EmptyResponse,
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Response violates schema: {0}")]
    Schema(String),
}

/// A structured generation request
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// JSON schema the response must match
    pub schema: Value,
}

/// Schema requiring exactly the two SMS bodies
pub fn alert_messages_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "family": { "type": "STRING", "description": "SMS for family" },
            "ambulance": { "type": "STRING", "description": "SMS for ambulance" }
        },
        "required": ["family", "ambulance"]
    })
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Run one generation round-trip and return the raw response text
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}

/// Gemini REST client
pub struct GeminiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiGenerator {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("lifeguard-node/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", GEMINI_BASE_URL, self.model)
    }

    fn request_body(request: &GenerationRequest) -> Value {
        json!({
            "contents": [{ "parts": [{ "text": request.prompt }] }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": request.schema,
            }
        })
    }
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

/// Concatenate the text parts of the first candidate
fn extract_text(body: &str) -> Result<String, GenerationError> {
    let response: GeminiResponse =
        serde_json::from_str(body).map_err(|e| GenerationError::Malformed(e.to_string()))?;

    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    Ok(text)
}

#[async_trait]
impl TextGenerator for GeminiGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::request_body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        debug!("Generation response: {} bytes", body.len());
        extract_text(&body)
    }
}
