//! Receipt field extraction with a local Ollama vision model

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::OllamaConfig;
use crate::error::{Error, Result};
use crate::storage::ReceiptDb;
use crate::types::{RecordId, TokenUsage};

use super::extractor::{ExtractionOutcome, ExtractionStatus, Extractor};

const EXTRACTION_PROMPT: &str = "You are reading a photo of a purchase receipt. \
Return a single JSON object with the keys merchant, date (YYYY-MM-DD), currency, \
subtotal, tax, total and line_items (an array of objects with description, quantity \
and amount). Use null for anything you cannot read. Return only JSON.";

/// Fallback wait when a 429 carries no usable Retry-After header
const DEFAULT_RETRY_AFTER_MS: u64 = 1_000;

/// Extractor calling Ollama's generate endpoint with the stored receipt image
///
/// Extraction runs synchronously, so the direct return is always terminal and
/// nothing is pushed through the status hub.
pub struct OllamaExtractor {
    client: Client,
    config: OllamaConfig,
    db: ReceiptDb,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    format: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

impl OllamaExtractor {
    pub fn new(config: OllamaConfig, db: ReceiptDb) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(5)
            .build()?;

        Ok(Self { client, config, db })
    }

    /// Check if Ollama is available
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.config.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn load_image(&self, record_id: &RecordId) -> Result<String> {
        let record = self
            .db
            .get_record(record_id)?
            .ok_or_else(|| Error::extraction(format!("unknown record {}", record_id)))?;
        let path = local_path(&record.url)
            .ok_or_else(|| Error::extraction(format!("unsupported storage url {}", record.url)))?;
        let data = tokio::fs::read(&path).await?;
        Ok(base64::engine::general_purpose::STANDARD.encode(data))
    }
}

#[async_trait]
impl Extractor for OllamaExtractor {
    async fn process(&self, record_id: &RecordId, model_hint: &str) -> Result<ExtractionOutcome> {
        let image = self.load_image(record_id).await?;
        let url = format!("{}/api/generate", self.config.base_url);
        let request = GenerateRequest {
            model: model_hint,
            prompt: EXTRACTION_PROMPT,
            images: vec![image],
            format: "json",
            stream: false,
            options: GenerateOptions {
                temperature: self.config.temperature,
            },
        };

        tracing::debug!("Extracting record {} with model {}", record_id, model_hint);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    Error::transient(format!("Extraction request failed: {}", e))
                } else {
                    Error::Http(e)
                }
            })?;

        let status = response.status();
        if matches!(status, StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE) {
            let retry_after_ms = retry_after_ms(response.headers()).unwrap_or(DEFAULT_RETRY_AFTER_MS);
            return Err(Error::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::extraction(format!("HTTP {} - {}", status, body)));
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::extraction(format!("Failed to parse generate response: {}", e)))?;

        let outcome = outcome_from(generated);
        self.db.save_extraction(record_id, &outcome.status)?;
        Ok(outcome)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

fn local_path(url: &str) -> Option<PathBuf> {
    url.strip_prefix("file://").map(PathBuf::from)
}

/// Delay from a Retry-After header holding a number of seconds
fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| secs.saturating_mul(1000))
}

fn outcome_from(generated: GenerateResponse) -> ExtractionOutcome {
    let usage = match (generated.prompt_eval_count, generated.eval_count) {
        (None, None) => None,
        (prompt, completion) => Some(TokenUsage {
            prompt_tokens: prompt.unwrap_or(0),
            completion_tokens: completion.unwrap_or(0),
        }),
    };

    let status = match serde_json::from_str::<serde_json::Value>(generated.response.trim()) {
        Ok(data) if data.is_object() => ExtractionStatus::Completed { data },
        Ok(_) => ExtractionStatus::Failed {
            reason: "model did not return a JSON object".to_string(),
        },
        Err(e) => ExtractionStatus::Failed {
            reason: format!("model output is not JSON: {}", e),
        },
    };

    ExtractionOutcome { status, usage }
}
