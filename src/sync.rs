//! Server side of the two-phase sync protocol.
//!
//! [`SyncService`] is stateless per request. Everything it remembers lives
//! in the injected [`KvStore`]: the last root recorded for each
//! `(caller, project)` pair, and the shared [`ContentCache`].
//!
//! # Exchanges
//!
//! | Operation | Reads | Writes |
//! |-----------|-------|--------|
//! | [`root_check`](SyncService::root_check) | project root | nothing |
//! | [`phase1`](SyncService::phase1) | fragment tier | TTL refresh on hits |
//! | [`phase2`](SyncService::phase2) | payload tier | fragments, payloads, project root |
//! | [`full_index`](SyncService::full_index) | fragment + payload tier | fragments, payloads, project root |
//!
//! Storage and processing failures degrade quietly (see [`crate::cache`]).
//! Only validation and authentication failures reach the caller.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use merkle_sync_core::merkle::fragment_hash;
use merkle_sync_core::models::{
    CallerIdentity, ChunkContent, FragmentPayload, FullIndexResponse, Phase1Request,
    Phase1Response, Phase2Request, Phase2Response, RootCheckRequest, RootCheckResponse,
};
use merkle_sync_core::processing::{align_payloads, plan_batches, DisabledProcessor, FragmentProcessor};
use merkle_sync_core::store::KvStore;
use merkle_sync_core::SyncError;

use crate::cache::{CacheTier, ContentCache, Partition};

const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(25);

/// Counts from one round of fragment processing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingReport {
    /// Fragments that reached the processor.
    pub processed: usize,
    /// Of those, how many got a placeholder instead of a real payload.
    pub degraded: usize,
    /// Fragments skipped because a good payload was already cached.
    pub reused: usize,
}

/// Handles root checks, Phase 1, Phase 2, and full index requests.
#[derive(Clone)]
pub struct SyncService {
    kv: Arc<dyn KvStore>,
    cache: ContentCache,
    processor: Arc<dyn FragmentProcessor>,
    processing_timeout: Duration,
    verify_content_hash: bool,
}

impl SyncService {
    /// New service with processing disabled and hash verification on.
    pub fn new(kv: Arc<dyn KvStore>, cache: ContentCache) -> Self {
        Self {
            kv,
            cache,
            processor: Arc::new(DisabledProcessor),
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            verify_content_hash: true,
        }
    }

    pub fn with_processor(mut self, processor: Arc<dyn FragmentProcessor>, timeout: Duration) -> Self {
        self.processor = processor;
        self.processing_timeout = timeout;
        self
    }

    /// When off, Phase 2 content is taken on trust.
    pub fn with_hash_verification(mut self, verify: bool) -> Self {
        self.verify_content_hash = verify;
        self
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Compares the caller's root with the last one recorded for the project.
    pub async fn root_check(
        &self,
        caller: &CallerIdentity,
        req: &RootCheckRequest,
    ) -> Result<RootCheckResponse, SyncError> {
        require("projectId", &req.project_id)?;
        require("merkleRoot", &req.merkle_root)?;

        let server_root = self.recorded_root(caller, &req.project_id).await;
        let changed = server_root.as_deref() != Some(req.merkle_root.as_str());
        debug!(
            caller = %caller,
            project = %req.project_id,
            changed,
            known = server_root.is_some(),
            "root check"
        );
        Ok(RootCheckResponse {
            changed,
            server_root,
        })
    }

    /// Partitions the submitted hashes into needed and cached.
    pub async fn phase1(
        &self,
        caller: &CallerIdentity,
        req: &Phase1Request,
    ) -> Result<Phase1Response, SyncError> {
        require("projectId", &req.project_id)?;
        require("merkleRoot", &req.merkle_root)?;

        let hashes: Vec<String> = req.chunks.iter().map(|c| c.hash.clone()).collect();
        let partition = self.cache.exists_many(&hashes).await;
        info!(
            caller = %caller,
            project = %req.project_id,
            submitted = hashes.len(),
            needed = partition.needed.len(),
            cached = partition.cached.len(),
            "phase 1"
        );
        Ok(partition.into())
    }

    /// Stores the submitted fragments and records the caller's new root.
    pub async fn phase2(
        &self,
        caller: &CallerIdentity,
        req: &Phase2Request,
    ) -> Result<Phase2Response, SyncError> {
        require("projectId", &req.project_id)?;
        require("merkleRoot", &req.merkle_root)?;
        let chunks = self.validate_chunks(&req.chunks)?;

        let (partition, stored) = self.store_fragments(&chunks).await;
        let report = self.process(&chunks).await;
        self.record_root(caller, &req.project_id, &req.merkle_root).await;

        info!(
            caller = %caller,
            project = %req.project_id,
            received = chunks.len(),
            already_cached = partition.cached.len(),
            stored,
            processed = report.processed,
            degraded = report.degraded,
            root = %req.merkle_root,
            "phase 2"
        );
        Ok(Phase2Response {
            received: chunks.iter().map(|c| c.hash.clone()).collect(),
            merkle_root: req.merkle_root.clone(),
        })
    }

    /// Phase 1 and Phase 2 in one exchange, for projects the server has
    /// never seen. Fragments another caller already submitted are reported
    /// as cached and not stored again.
    pub async fn full_index(
        &self,
        caller: &CallerIdentity,
        req: &Phase2Request,
    ) -> Result<FullIndexResponse, SyncError> {
        require("projectId", &req.project_id)?;
        require("merkleRoot", &req.merkle_root)?;
        let chunks = self.validate_chunks(&req.chunks)?;

        let (partition, stored) = self.store_fragments(&chunks).await;
        let report = self.process(&chunks).await;
        self.record_root(caller, &req.project_id, &req.merkle_root).await;

        info!(
            caller = %caller,
            project = %req.project_id,
            received = partition.needed.len(),
            cached = partition.cached.len(),
            stored,
            processed = report.processed,
            degraded = report.degraded,
            root = %req.merkle_root,
            "full index"
        );
        Ok(FullIndexResponse {
            received: partition.needed,
            cached: partition.cached,
            merkle_root: req.merkle_root.clone(),
        })
    }

    /// Rejects empty or mismatched hashes and drops repeated ones.
    fn validate_chunks(&self, chunks: &[ChunkContent]) -> Result<Vec<ChunkContent>, SyncError> {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if chunk.hash.trim().is_empty() {
                return Err(SyncError::invalid("chunk hash must not be empty"));
            }
            if self.verify_content_hash && fragment_hash(&chunk.content) != chunk.hash {
                return Err(SyncError::invalid(format!(
                    "content does not match hash {}",
                    chunk.hash
                )));
            }
            if seen.insert(chunk.hash.as_str()) {
                unique.push(chunk.clone());
            }
        }
        Ok(unique)
    }

    /// Stores metadata for fragments not seen before. The first submission
    /// of a hash wins; later ones only refresh its TTL.
    async fn store_fragments(&self, chunks: &[ChunkContent]) -> (Partition, usize) {
        let hashes: Vec<String> = chunks.iter().map(|c| c.hash.clone()).collect();
        let partition = self.cache.exists_many(&hashes).await;
        let needed: HashSet<&str> = partition.needed.iter().map(String::as_str).collect();

        let items = chunks
            .iter()
            .filter(|c| needed.contains(c.hash.as_str()))
            .map(|c| {
                let meta = json!({
                    "kind": c.kind,
                    "name": c.name,
                    "languageId": c.language_id,
                    "lineRange": c.line_range,
                    "size": c.size,
                });
                (c.hash.clone(), meta)
            })
            .collect();
        let stored = self.cache.put_many(CacheTier::Fragment, items).await;
        (partition, stored)
    }

    /// Summarizes and embeds the fragments that have no good payload yet.
    ///
    /// Batches run concurrently under one shared deadline. A batch that
    /// fails or misses the deadline gets placeholder payloads, so every
    /// input position still receives exactly one payload.
    pub async fn process(&self, chunks: &[ChunkContent]) -> ProcessingReport {
        if chunks.is_empty() || !self.processor.is_enabled() {
            return ProcessingReport::default();
        }

        let existing = join_all(
            chunks
                .iter()
                .map(|c| self.cache.get(CacheTier::Payload, &c.hash)),
        )
        .await;
        let missing: Vec<ChunkContent> = chunks
            .iter()
            .zip(existing)
            .filter(|(_, entry)| match entry {
                Some(entry) => entry.payload["degraded"].as_bool().unwrap_or(false),
                None => true,
            })
            .map(|(c, _)| c.clone())
            .collect();

        let mut report = ProcessingReport {
            reused: chunks.len() - missing.len(),
            ..ProcessingReport::default()
        };
        if missing.is_empty() {
            return report;
        }

        let dims = self.processor.dims();
        let deadline = Instant::now() + self.processing_timeout;
        let plans = plan_batches(&missing, self.processor.max_batch());

        let results = join_all(plans.iter().map(|plan| {
            let batch: Vec<ChunkContent> = plan.indices.iter().map(|&i| missing[i].clone()).collect();
            async move {
                let outcome = tokio::time::timeout_at(
                    deadline,
                    self.processor.process_batch(&plan.language_id, &batch),
                )
                .await;
                let payloads = match outcome {
                    Ok(Ok(payloads)) => payloads,
                    Ok(Err(e)) => {
                        warn!(language = %plan.language_id, size = batch.len(), error = %e, "processing failed, using placeholders");
                        Vec::new()
                    }
                    Err(_) => {
                        let err = SyncError::UpstreamTimeout(self.processor.model_name().to_string());
                        warn!(language = %plan.language_id, size = batch.len(), error = %err, "processing timed out, using placeholders");
                        Vec::new()
                    }
                };
                (batch, align_payloads(payloads, plan.indices.len(), dims))
            }
        }))
        .await;

        let mut items = Vec::with_capacity(missing.len());
        for (batch, payloads) in results {
            for (chunk, payload) in batch.into_iter().zip(payloads) {
                report.processed += 1;
                if payload.degraded {
                    report.degraded += 1;
                }
                items.push((chunk.hash, payload_value(&payload)));
            }
        }
        self.cache.put_many(CacheTier::Payload, items).await;
        report
    }

    async fn recorded_root(&self, caller: &CallerIdentity, project_id: &str) -> Option<String> {
        let key = root_key(caller, project_id);
        match self.kv.get(&key).await {
            Ok(root) => root,
            Err(e) => {
                // Unknown project means a full index: over-transfer, never loss
                let err = SyncError::StorageUnavailable(e.to_string());
                warn!(key = %key, error = %err, "root lookup failed, treating project as unseen");
                None
            }
        }
    }

    async fn record_root(&self, caller: &CallerIdentity, project_id: &str, root: &str) {
        let key = root_key(caller, project_id);
        if let Err(e) = self.kv.put(&key, root, None).await {
            let err = SyncError::StorageUnavailable(e.to_string());
            warn!(key = %key, error = %err, "failed to record project root");
        }
    }
}

/// `root:{caller}:{projectId}`. The caller part is escaped so it never
/// contains `:`, which keeps distinct pairs on distinct keys.
fn root_key(caller: &CallerIdentity, project_id: &str) -> String {
    let caller = caller.as_str().replace('%', "%25").replace(':', "%3A");
    format!("root:{}:{}", caller, project_id)
}

fn require(field: &str, value: &str) -> Result<(), SyncError> {
    if value.trim().is_empty() {
        return Err(SyncError::invalid(format!("{} is required", field)));
    }
    Ok(())
}

fn payload_value(payload: &FragmentPayload) -> serde_json::Value {
    serde_json::to_value(payload).unwrap_or_else(|_| json!({ "degraded": true }))
}
