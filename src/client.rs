//! Client side of the sync protocol.
//!
//! [`SyncClient::sync`] walks the state machine for one project:
//!
//! ```text
//! Idle ──check──▶ CheckedRoot ──equal──────────────────────────▶ Idle
//!                     │ serverRoot = null ──full index─────────▶ Idle
//!                     └ differs ──phase 1──▶ Phase1Sent ──phase 2──▶ Idle
//! ```
//!
//! Phase 1 covers the fragments of dirty files, or of every tracked file
//! when the roots differ but nothing is queued (a lost queue, or another
//! machine synced the same project). Phase 2 sends content only for the
//! hashes the server asked for.
//!
//! Every run first diffs a fresh scan against the saved snapshot and
//! queues whatever changed, so edits the watcher never reported are sent
//! too.
//!
//! The dirty queue is drained only after the server has acknowledged the
//! new root. Any failure leaves it intact so the next run retries.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use merkle_sync_core::merkle::diff_leaves;
use merkle_sync_core::models::{
    ChunkContent, Fragment, FullIndexResponse, Phase1Request, Phase1Response, Phase2Request,
    Phase2Response, RootCheckRequest, RootCheckResponse,
};

use crate::config::Config;
use crate::scan::{build_tree, fragments_for, ProjectFilter};
use crate::state_store::TreeStateStore;

/// Where a sync run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Server already had this root; nothing was sent.
    UpToDate,
    /// Server had never seen the project; everything went in one request.
    FullIndexed,
    /// Phase 1 and Phase 2 completed.
    Synced,
}

/// Summary of one sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub state: SyncState,
    pub root: String,
    /// Fragments described (hash only) in Phase 1.
    pub phase1_fragments: usize,
    /// Fragments sent with content, in Phase 2 or the full index.
    pub content_fragments: usize,
    /// Fragments the server already had.
    pub cached_fragments: usize,
    /// Total content bytes put on the wire.
    pub content_bytes: usize,
    /// Dirty ids cleared by this run.
    pub drained: usize,
}

impl SyncOutcome {
    fn new(state: SyncState, root: &str) -> Self {
        Self {
            state,
            root: root.to_string(),
            phase1_fragments: 0,
            content_fragments: 0,
            cached_fragments: 0,
            content_bytes: 0,
            drained: 0,
        }
    }
}

/// Fragments whose hash the server flagged as needed, with content.
///
/// Never returns a fragment outside `needed`, and returns each needed
/// hash at most once.
pub fn select_needed(fragments: &[Fragment], needed: &[String]) -> Vec<ChunkContent> {
    let needed: HashSet<&str> = needed.iter().map(String::as_str).collect();
    let mut sent = HashSet::new();
    fragments
        .iter()
        .filter(|f| needed.contains(f.hash.as_str()) && sent.insert(f.hash.as_str()))
        .filter_map(Fragment::to_content)
        .collect()
}

/// HTTP client for one project's sync exchanges.
pub struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    credential: String,
    project_id: String,
}

impl SyncClient {
    pub fn new(
        base_url: &str,
        credential: impl Into<String>,
        project_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential: credential.into(),
            project_id: project_id.into(),
        })
    }

    /// Client from `[client]`, reading the credential from the configured
    /// environment variable.
    pub fn from_config(config: &Config) -> Result<Self> {
        let env = &config.client.credential_env;
        let credential = std::env::var(env).unwrap_or_default();
        if credential.trim().is_empty() {
            bail!("{} environment variable not set (see `msync token`)", env);
        }
        Self::new(
            &config.client.server_url,
            credential,
            config.project.id.clone(),
            Duration::from_secs(config.client.timeout_secs),
        )
    }

    pub async fn root_check(&self, merkle_root: &str) -> Result<RootCheckResponse> {
        let req = RootCheckRequest {
            project_id: self.project_id.clone(),
            merkle_root: merkle_root.to_string(),
        };
        self.post("/v1/sync/check", &req).await
    }

    pub async fn phase1(&self, merkle_root: &str, fragments: &[Fragment]) -> Result<Phase1Response> {
        let req = Phase1Request {
            project_id: self.project_id.clone(),
            merkle_root: merkle_root.to_string(),
            chunks: fragments.iter().map(Fragment::descriptor).collect(),
        };
        self.post("/v1/sync/phase1", &req).await
    }

    pub async fn phase2(&self, merkle_root: &str, chunks: Vec<ChunkContent>) -> Result<Phase2Response> {
        let req = Phase2Request {
            project_id: self.project_id.clone(),
            merkle_root: merkle_root.to_string(),
            chunks,
        };
        self.post("/v1/sync/phase2", &req).await
    }

    pub async fn full_index(&self, merkle_root: &str, chunks: Vec<ChunkContent>) -> Result<FullIndexResponse> {
        let req = Phase2Request {
            project_id: self.project_id.clone(),
            merkle_root: merkle_root.to_string(),
            chunks,
        };
        self.post("/v1/index/full", &req).await
    }

    /// Runs one full sync of the project described by `filter`.
    pub async fn sync(
        &self,
        filter: &ProjectFilter,
        store: &TreeStateStore,
        max_fragment_lines: usize,
    ) -> Result<SyncOutcome> {
        let tree = build_tree(filter)?;
        // Changes nobody queued still have to reach the server
        let unqueued: Vec<String> = match store.load() {
            Some(baseline) => diff_leaves(&baseline.leaves, tree.leaves()).changed_ids(),
            None => tree.leaves().iter().map(|l| l.id.clone()).collect(),
        };
        store.save(&tree.snapshot())?;
        let newly_dirty = store.enqueue_many(unqueued)?;
        if newly_dirty > 0 {
            debug!(newly_dirty, "queued changes found by rescan");
        }
        let root = tree.root().to_string();

        let check = self.root_check(&root).await?;
        if !check.changed {
            let drained = store.drain_dirty()?.len();
            info!(root = %root, drained, "server already up to date");
            return Ok(SyncOutcome {
                drained,
                ..SyncOutcome::new(SyncState::UpToDate, &root)
            });
        }

        let all_ids: Vec<String> = tree.leaves().iter().map(|l| l.id.clone()).collect();

        if check.server_root.is_none() {
            let fragments = fragments_for(filter, &all_ids, max_fragment_lines)?;
            let chunks: Vec<ChunkContent> = dedup_by_hash(&fragments)
                .iter()
                .filter_map(Fragment::to_content)
                .collect();
            let content_bytes = content_len(&chunks);
            let sent = chunks.len();

            let resp = self.full_index(&root, chunks).await?;
            let drained = store.drain_dirty()?.len();
            info!(
                root = %resp.merkle_root,
                received = resp.received.len(),
                cached = resp.cached.len(),
                "full index complete"
            );
            return Ok(SyncOutcome {
                content_fragments: sent,
                cached_fragments: resp.cached.len(),
                content_bytes,
                drained,
                ..SyncOutcome::new(SyncState::FullIndexed, &root)
            });
        }

        let dirty = store.dirty().pending;
        let ids: BTreeSet<String> = if dirty.is_empty() {
            debug!("roots differ with an empty dirty queue, checking every file");
            all_ids.into_iter().collect()
        } else {
            dirty
        };
        let fragments = dedup_by_hash(&fragments_for(filter, &ids, max_fragment_lines)?);

        let partition = self.phase1(&root, &fragments).await?;
        let chunks = select_needed(&fragments, &partition.needed);
        let content_bytes = content_len(&chunks);
        let sent = chunks.len();

        let resp = self.phase2(&root, chunks).await?;
        let drained = store.drain_dirty()?.len();
        info!(
            root = %resp.merkle_root,
            described = fragments.len(),
            sent,
            cached = partition.cached.len(),
            content_bytes,
            "sync complete"
        );
        Ok(SyncOutcome {
            phase1_fragments: fragments.len(),
            content_fragments: sent,
            cached_fragments: partition.cached.len(),
            content_bytes,
            drained,
            ..SyncOutcome::new(SyncState::Synced, &root)
        })
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.credential)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;

        let status = response.status();
        if !status.is_success() {
            // Protocol errors are never retried
            let body_text = response.text().await.unwrap_or_default();
            bail!("{} returned {}: {}", path, status, body_text);
        }

        response
            .json()
            .await
            .with_context(|| format!("Invalid response from {}", path))
    }
}

fn dedup_by_hash(fragments: &[Fragment]) -> Vec<Fragment> {
    let mut seen = HashSet::new();
    fragments
        .iter()
        .filter(|f| seen.insert(f.hash.clone()))
        .cloned()
        .collect()
}

fn content_len(chunks: &[ChunkContent]) -> usize {
    chunks.iter().map(|c| c.content.len()).sum()
}
