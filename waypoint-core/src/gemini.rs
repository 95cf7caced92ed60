use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

use crate::generator::{GenerationError, TextBackend};
use crate::http::create_http_client;
use crate::recording::CORRELATION_ID_HEADER;

pub const DEFAULT_GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com";

/// Client for the Gemini `generateContent` endpoint.
#[derive(Clone)]
pub struct GeminiClient {
    client: ClientWithMiddleware,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Part {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    pub finish_reason: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate.
    pub fn text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text: String = content
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

impl GeminiClient {
    pub fn new(api_key: String) -> Result<Self, reqwest::Error> {
        Ok(Self::with_client(
            create_http_client(Duration::from_secs(120))?,
            api_key,
            DEFAULT_GEMINI_API_URL,
        ))
    }

    pub fn with_client(
        client: ClientWithMiddleware,
        api_key: String,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }
}

#[async_trait]
impl TextBackend for GeminiClient {
    async fn generate(
        &self,
        correlation_id: Option<&str>,
        model: &str,
        prompt: &str,
    ) -> Result<String, GenerationError> {
        let request_body = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: Some(prompt.to_string()),
                }],
            }],
        };

        info!(
            "Requesting content from {} ({} prompt bytes)",
            model,
            prompt.len()
        );

        let unavailable = |message: String| GenerationError::Unavailable {
            model: model.to_string(),
            message,
        };

        let body = serde_json::to_string(&request_body)
            .map_err(|e| unavailable(format!("failed to encode request: {}", e)))?;

        let mut request_builder = self
            .client
            .post(self.endpoint(model))
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .body(body);

        if let Some(cid) = correlation_id {
            request_builder = request_builder.header(CORRELATION_ID_HEADER, cid);
        }

        let response = request_builder
            .send()
            .await
            .map_err(|e| unavailable(format!("failed to send request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read error body: {}>", e));
            error!("Gemini API error: {} - {}", status, error_text);
            return Err(classify_failure(model, status, &error_text));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| unavailable(format!("failed to parse response: {}", e)))?;

        match parsed.text() {
            Some(text) => {
                info!("Received {} bytes of generated text from {}", text.len(), model);
                Ok(text)
            }
            None => {
                let reason = parsed
                    .candidates
                    .first()
                    .and_then(|c| c.finish_reason.clone())
                    .unwrap_or_else(|| "no candidates".to_string());
                Err(unavailable(format!("empty response ({})", reason)))
            }
        }
    }
}

/// Map an unsuccessful HTTP response to a generation failure.
///
/// 429 and quota exhaustion are rate limits; everything else is retried as
/// an ordinary failure.
pub fn classify_failure(model: &str, status: StatusCode, body: &str) -> GenerationError {
    let message = format!("{} - {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || body.contains("RESOURCE_EXHAUSTED") {
        GenerationError::RateLimited {
            model: model.to_string(),
            message,
        }
    } else {
        GenerationError::Unavailable {
            model: model.to_string(),
            message,
        }
    }
}
