//! Core data models and wire types used throughout Merkle Sync.
//!
//! Local state ([`Leaf`], [`TreeSnapshot`], [`DirtyQueue`]) is owned by the
//! watching side. [`Fragment`] is the sync unit; it travels as a
//! [`ChunkDescriptor`] (hash only) in Phase 1 and as a [`ChunkContent`]
//! (with content) in Phase 2. Request and response bodies use camelCase
//! field names on the wire.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Smallest unit tracked by the hash tree: a file or a code fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    /// Stable path or fragment identity. Opaque to the tree.
    pub id: String,
    /// Content digest.
    pub hash: String,
}

impl Leaf {
    pub fn new(id: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hash: hash.into(),
        }
    }
}

/// Durable picture of the tree: its root plus the leaves it was built from.
///
/// `leaves` is always sorted by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSnapshot {
    pub root: String,
    pub leaves: Vec<Leaf>,
    pub taken_at: DateTime<Utc>,
}

/// Set of leaf ids changed since the last completed sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtyQueue {
    pub last_synced_at: Option<DateTime<Utc>>,
    pub pending: BTreeSet<String>,
}

impl DirtyQueue {
    /// Adds `id` to the pending set. Returns `false` if it was already pending.
    pub fn enqueue(&mut self, id: impl Into<String>) -> bool {
        self.pending.insert(id.into())
    }

    /// Empties the queue and advances `last_synced_at` to now.
    pub fn drain(&mut self) -> BTreeSet<String> {
        self.last_synced_at = Some(Utc::now());
        std::mem::take(&mut self.pending)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Semantic kind of a code fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentKind {
    Function,
    Class,
    Method,
    Interface,
    Type,
    Enum,
    Struct,
    Impl,
    Trait,
    Block,
}

/// A sub-file unit of code, the sync granularity of Phase 1 and Phase 2.
///
/// `content` is always present on the client; it is only put on the wire
/// for fragments the server reports as needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub kind: FragmentKind,
    pub name: Option<String>,
    /// 1-based inclusive line range within the source file.
    pub line_range: (u32, u32),
    pub size: usize,
    pub language_id: String,
}

impl Fragment {
    /// Hash-only view sent in Phase 1.
    pub fn descriptor(&self) -> ChunkDescriptor {
        ChunkDescriptor {
            hash: self.hash.clone(),
            kind: self.kind,
            name: self.name.clone(),
            line_range: self.line_range,
            size: self.size,
        }
    }

    /// Full view sent in Phase 2. Returns `None` when the fragment carries
    /// no content.
    pub fn to_content(&self) -> Option<ChunkContent> {
        let content = self.content.clone()?;
        Some(ChunkContent {
            hash: self.hash.clone(),
            content,
            kind: self.kind,
            name: self.name.clone(),
            language_id: self.language_id.clone(),
            line_range: self.line_range,
            size: self.size,
        })
    }
}

/// Phase 1 chunk: metadata and hash, content deliberately omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub hash: String,
    pub kind: FragmentKind,
    pub name: Option<String>,
    pub line_range: (u32, u32),
    pub size: usize,
}

/// Phase 2 chunk: everything the server needs to store and process it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkContent {
    pub hash: String,
    pub content: String,
    pub kind: FragmentKind,
    pub name: Option<String>,
    pub language_id: String,
    pub line_range: (u32, u32),
    pub size: usize,
}

/// Server-side cache record, keyed by fragment hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub hash: String,
    pub payload: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

/// Processed form of a fragment produced by the AI backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentPayload {
    pub summary: String,
    pub embedding: Vec<f32>,
    /// `true` when the backend failed and this is a placeholder.
    #[serde(default)]
    pub degraded: bool,
}

impl FragmentPayload {
    /// Placeholder used when processing timed out or failed.
    pub fn placeholder(dims: usize) -> Self {
        Self {
            summary: String::new(),
            embedding: vec![0.0; dims],
            degraded: true,
        }
    }
}

/// Authenticated caller, attached to each request upstream of the handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerIdentity(String);

impl CallerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============ Wire protocol ============

/// `POST /v1/sync/check` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootCheckRequest {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub merkle_root: String,
}

/// `POST /v1/sync/check` response. `server_root = None` means the server
/// has never seen the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootCheckResponse {
    pub changed: bool,
    pub server_root: Option<String>,
}

/// `POST /v1/sync/phase1` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase1Request {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub merkle_root: String,
    pub chunks: Vec<ChunkDescriptor>,
}

/// `POST /v1/sync/phase1` response: an exhaustive, disjoint partition of
/// the submitted hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase1Response {
    pub needed: Vec<String>,
    pub cached: Vec<String>,
}

/// `POST /v1/sync/phase2` and `POST /v1/index/full` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase2Request {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub merkle_root: String,
    pub chunks: Vec<ChunkContent>,
}

/// `POST /v1/sync/phase2` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase2Response {
    pub received: Vec<String>,
    pub merkle_root: String,
}

/// `POST /v1/index/full` response. `cached` lists submitted hashes that
/// some earlier caller had already indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullIndexResponse {
    pub received: Vec<String>,
    pub cached: Vec<String>,
    pub merkle_root: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fragment() -> Fragment {
        Fragment {
            hash: "abc".to_string(),
            content: Some("fn main() {}".to_string()),
            kind: FragmentKind::Function,
            name: Some("main".to_string()),
            line_range: (1, 1),
            size: 12,
            language_id: "rust".to_string(),
        }
    }

    #[test]
    fn test_descriptor_omits_content() {
        let json = serde_json::to_value(sample_fragment().descriptor()).unwrap();
        assert!(json.get("content").is_none());
        assert!(json.get("languageId").is_none());
        assert_eq!(json["lineRange"], serde_json::json!([1, 1]));
        assert_eq!(json["kind"], "function");
    }

    #[test]
    fn test_to_content_requires_content() {
        let mut frag = sample_fragment();
        assert_eq!(frag.to_content().unwrap().language_id, "rust");
        frag.content = None;
        assert!(frag.to_content().is_none());
    }

    #[test]
    fn test_dirty_queue_set_semantics() {
        let mut q = DirtyQueue::default();
        assert!(q.enqueue("a.rs"));
        assert!(!q.enqueue("a.rs"));
        assert!(q.enqueue("b.rs"));
        assert_eq!(q.pending.len(), 2);

        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert!(q.is_empty());
        assert!(q.last_synced_at.is_some());
    }

    #[test]
    fn test_root_check_response_serializes_null_root() {
        let resp = RootCheckResponse {
            changed: true,
            server_root: None,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"changed":true,"serverRoot":null}"#);
    }

    #[test]
    fn test_request_missing_project_id_defaults_empty() {
        let req: RootCheckRequest = serde_json::from_str(r#"{"merkleRoot":"r"}"#).unwrap();
        assert!(req.project_id.is_empty());
        assert_eq!(req.merkle_root, "r");
    }
}
