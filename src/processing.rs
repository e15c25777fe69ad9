//! HTTP fragment processors: summaries and embeddings from OpenAI or Ollama.
//!
//! [`create_processor`] picks the backend from `[processing]`:
//!
//! | Provider | Embeddings | Summaries (when `model` is set) |
//! |----------|------------|---------------------------------|
//! | `disabled` | none | none |
//! | `openai` | `POST {url}/v1/embeddings` | `POST {url}/v1/chat/completions` |
//! | `ollama` | `POST {url}/api/embed` | `POST {url}/api/chat` |
//!
//! Without a chat model, or when the chat call fails, each fragment gets a
//! one-line outline summary instead. Embeddings have no such fallback: a
//! failed embedding call fails the batch, and the caller substitutes
//! placeholders.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, ... (capped at 2^5)
//!
//! The caller's processing deadline bounds the whole sequence.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use merkle_sync_core::models::{ChunkContent, FragmentPayload};
use merkle_sync_core::processing::{DisabledProcessor, FragmentProcessor};

use crate::config::ProcessingConfig;

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";
const SUMMARY_MAX_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    OpenAI,
    Ollama,
}

impl Backend {
    fn label(self) -> &'static str {
        match self {
            Backend::OpenAI => "OpenAI",
            Backend::Ollama => "Ollama",
        }
    }
}

/// Fragment processor backed by an HTTP model API.
pub struct HttpProcessor {
    backend: Backend,
    url: String,
    api_key: Option<String>,
    embedding_model: String,
    summary_model: Option<String>,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpProcessor {
    /// OpenAI processor. Requires `OPENAI_API_KEY` in the environment.
    pub fn openai(config: &ProcessingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Self::build(Backend::OpenAI, config, OPENAI_URL, Some(api_key))
    }

    /// Ollama processor. Ollama must be running with the models pulled.
    pub fn ollama(config: &ProcessingConfig) -> Result<Self> {
        Self::build(Backend::Ollama, config, OLLAMA_URL, None)
    }

    fn build(
        backend: Backend,
        config: &ProcessingConfig,
        default_url: &str,
        api_key: Option<String>,
    ) -> Result<Self> {
        let embedding_model = config
            .embedding_model
            .clone()
            .ok_or_else(|| anyhow!("processing.embedding_model required for {}", backend.label()))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("processing.dims required for {}", backend.label()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| default_url.to_string())
            .trim_end_matches('/')
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            backend,
            url,
            api_key,
            embedding_model,
            summary_model: config.model.clone(),
            dims,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            client,
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({
            "model": self.embedding_model,
            "input": texts,
        });
        match self.backend {
            Backend::OpenAI => {
                let json = self.post_with_retry("/v1/embeddings", &body).await?;
                parse_openai_embeddings(&json)
            }
            Backend::Ollama => {
                let json = self.post_with_retry("/api/embed", &body).await?;
                parse_ollama_embeddings(&json)
            }
        }
    }

    async fn summarize(&self, model: &str, language_id: &str, chunks: &[ChunkContent]) -> Result<Vec<String>> {
        let messages = json!([
            {
                "role": "system",
                "content": "You summarize source code fragments. Reply with a JSON object \
                            {\"summaries\": [...]} holding one short sentence per fragment, in order."
            },
            { "role": "user", "content": summary_prompt(language_id, chunks) }
        ]);
        let reply = match self.backend {
            Backend::OpenAI => {
                let body = json!({
                    "model": model,
                    "messages": messages,
                    "response_format": { "type": "json_object" },
                });
                let json = self.post_with_retry("/v1/chat/completions", &body).await?;
                json.pointer("/choices/0/message/content")
                    .and_then(|c| c.as_str())
                    .ok_or_else(|| anyhow!("Invalid OpenAI response: missing message content"))?
                    .to_string()
            }
            Backend::Ollama => {
                let body = json!({
                    "model": model,
                    "messages": messages,
                    "stream": false,
                    "format": "json",
                });
                let json = self.post_with_retry("/api/chat", &body).await?;
                json.pointer("/message/content")
                    .and_then(|c| c.as_str())
                    .ok_or_else(|| anyhow!("Invalid Ollama response: missing message content"))?
                    .to_string()
            }
        };
        parse_summaries(&reply)
    }

    /// POSTs `body` to `path`, retrying rate limits, server errors, and
    /// network errors with exponential backoff.
    async fn post_with_retry(&self, path: &str, body: &Value) -> Result<Value> {
        let endpoint = format!("{}{}", self.url, path);
        let label = self.backend.label();
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(&endpoint).json(body);
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json()
                            .await
                            .with_context(|| format!("Invalid {} response body", label));
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("{} API error {}: {}", label, status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow!("{} connection error ({}): {}", label, self.url, e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("{} request failed after retries", label)))
    }
}

#[async_trait]
impl FragmentProcessor for HttpProcessor {
    fn model_name(&self) -> &str {
        &self.embedding_model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn max_batch(&self) -> usize {
        self.batch_size
    }

    async fn process_batch(
        &self,
        language_id: &str,
        chunks: &[ChunkContent],
    ) -> Result<Vec<FragmentPayload>> {
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embed(&texts).await?;

        let mut summaries = match &self.summary_model {
            Some(model) => match self.summarize(model, language_id, chunks).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(language = %language_id, error = %e, "summary call failed, using outlines");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        if summaries.len() != chunks.len() {
            summaries = chunks.iter().map(outline_summary).collect();
        }

        Ok(summaries
            .into_iter()
            .zip(embeddings)
            .map(|(summary, embedding)| FragmentPayload {
                summary,
                embedding,
                degraded: false,
            })
            .collect())
    }
}

/// Builds the processor named by `config.provider`.
pub fn create_processor(config: &ProcessingConfig) -> Result<Arc<dyn FragmentProcessor>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProcessor)),
        "openai" => Ok(Arc::new(HttpProcessor::openai(config)?)),
        "ollama" => Ok(Arc::new(HttpProcessor::ollama(config)?)),
        other => bail!("Unknown processing provider: {}", other),
    }
}

/// One-line description of a fragment from its metadata and first line.
pub fn outline_summary(chunk: &ChunkContent) -> String {
    let first_line = chunk
        .content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let kind = format!("{:?}", chunk.kind).to_lowercase();
    let label = match &chunk.name {
        Some(name) => format!("{} {}", kind, name),
        None => kind,
    };
    let mut summary = format!(
        "{} ({}, lines {}-{}): {}",
        label,
        chunk.language_id,
        chunk.line_range.0,
        chunk.line_range.1,
        first_line
    );
    if summary.chars().count() > SUMMARY_MAX_CHARS {
        summary = summary.chars().take(SUMMARY_MAX_CHARS).collect();
    }
    summary
}

fn summary_prompt(language_id: &str, chunks: &[ChunkContent]) -> String {
    let mut prompt = format!("{} fragments:\n", language_id);
    for (i, chunk) in chunks.iter().enumerate() {
        prompt.push_str(&format!("\n--- fragment {} ---\n{}\n", i + 1, chunk.content));
    }
    prompt
}

fn parse_summaries(reply: &str) -> Result<Vec<String>> {
    let json: Value = serde_json::from_str(reply).context("summary reply is not JSON")?;
    let items = json
        .get("summaries")
        .and_then(|s| s.as_array())
        .ok_or_else(|| anyhow!("summary reply missing summaries array"))?;
    Ok(items
        .iter()
        .map(|s| s.as_str().unwrap_or_default().trim().to_string())
        .collect())
}

/// Extracts `data[].embedding`, ordered by each item's `index`.
fn parse_openai_embeddings(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, to_vector(embedding)));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_embeddings(json: &Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| to_vector(values))
                .ok_or_else(|| anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}

fn to_vector(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}
