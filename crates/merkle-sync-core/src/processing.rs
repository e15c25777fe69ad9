//! Fragment-processing trait and batching utilities.
//!
//! Defines the [`FragmentProcessor`] trait that AI backends
//! (summarization + embedding) implement, plus pure helpers that keep
//! batch output positionally aligned with batch input.
//!
//! Concrete processors (OpenAI, Ollama) live in the `merkle-sync` app
//! crate, which also enforces timeouts around every call.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{ChunkContent, FragmentPayload};

/// Trait for fragment-processing backends.
///
/// A call receives one batch of fragments that all share a language and
/// never more than [`max_batch`](FragmentProcessor::max_batch) items.
#[async_trait]
pub trait FragmentProcessor: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Hard per-batch item cap, tuned to the model's context window.
    fn max_batch(&self) -> usize;

    /// `false` for the disabled backend; callers skip processing entirely.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Summarize and embed one batch. Results should be in input order;
    /// callers pad or truncate with [`align_payloads`].
    async fn process_batch(
        &self,
        language_id: &str,
        chunks: &[ChunkContent],
    ) -> Result<Vec<FragmentPayload>>;
}

/// Backend used when processing is not configured.
pub struct DisabledProcessor;

#[async_trait]
impl FragmentProcessor for DisabledProcessor {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    fn max_batch(&self) -> usize {
        1
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn process_batch(
        &self,
        _language_id: &str,
        _chunks: &[ChunkContent],
    ) -> Result<Vec<FragmentPayload>> {
        bail!("Fragment processing is disabled")
    }
}

/// One batch of input positions sharing a language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub language_id: String,
    /// Indices into the original input slice.
    pub indices: Vec<usize>,
}

/// Groups `chunks` by language (in first-seen order) and splits each group
/// into batches of at most `max_batch` items.
pub fn plan_batches(chunks: &[ChunkContent], max_batch: usize) -> Vec<BatchPlan> {
    let max_batch = max_batch.max(1);
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();

    for (i, chunk) in chunks.iter().enumerate() {
        let lang = chunk.language_id.as_str();
        if !groups.contains_key(lang) {
            order.push(lang.to_string());
        }
        groups.entry(lang).or_default().push(i);
    }

    let mut plans = Vec::new();
    for lang in order {
        let indices = groups.remove(lang.as_str()).unwrap_or_default();
        for batch in indices.chunks(max_batch) {
            plans.push(BatchPlan {
                language_id: lang.clone(),
                indices: batch.to_vec(),
            });
        }
    }
    plans
}

/// Forces `payloads` to exactly `expected` items, padding with
/// placeholders and dropping extras.
pub fn align_payloads(
    mut payloads: Vec<FragmentPayload>,
    expected: usize,
    dims: usize,
) -> Vec<FragmentPayload> {
    payloads.truncate(expected);
    while payloads.len() < expected {
        payloads.push(FragmentPayload::placeholder(dims));
    }
    payloads
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FragmentKind;

    fn chunk(hash: &str, lang: &str) -> ChunkContent {
        ChunkContent {
            hash: hash.to_string(),
            content: format!("content {}", hash),
            kind: FragmentKind::Function,
            name: None,
            language_id: lang.to_string(),
            line_range: (1, 1),
            size: 9,
        }
    }

    #[test]
    fn test_plan_groups_by_language_and_caps() {
        let chunks = vec![
            chunk("a", "rust"),
            chunk("b", "python"),
            chunk("c", "rust"),
            chunk("d", "rust"),
            chunk("e", "python"),
        ];
        let plans = plan_batches(&chunks, 2);
        assert_eq!(
            plans,
            vec![
                BatchPlan {
                    language_id: "rust".into(),
                    indices: vec![0, 2]
                },
                BatchPlan {
                    language_id: "rust".into(),
                    indices: vec![3]
                },
                BatchPlan {
                    language_id: "python".into(),
                    indices: vec![1, 4]
                },
            ]
        );
        let covered: usize = plans.iter().map(|p| p.indices.len()).sum();
        assert_eq!(covered, chunks.len());
    }

    #[test]
    fn test_plan_empty() {
        assert!(plan_batches(&[], 8).is_empty());
    }

    #[test]
    fn test_align_pads_short_output() {
        let out = align_payloads(vec![], 3, 4);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|p| p.degraded && p.embedding == vec![0.0; 4]));
    }

    #[test]
    fn test_align_truncates_long_output() {
        let extra = FragmentPayload {
            summary: "s".into(),
            embedding: vec![1.0],
            degraded: false,
        };
        let out = align_payloads(vec![extra.clone(), extra.clone(), extra], 2, 1);
        assert_eq!(out.len(), 2);
        assert!(!out[0].degraded);
    }

    #[tokio::test]
    async fn test_disabled_processor() {
        let p = DisabledProcessor;
        assert!(!p.is_enabled());
        assert!(p.process_batch("rust", &[chunk("a", "rust")]).await.is_err());
    }
}
