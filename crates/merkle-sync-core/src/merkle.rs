//! Deterministic, incrementally updatable hash tree over a named leaf set.
//!
//! The root of the tree is the cheap "has anything changed" check the
//! whole sync protocol is built on: two leaf sets with equal roots are,
//! up to digest collision, identical.
//!
//! # Algorithm
//!
//! 1. Wrap each leaf (sorted by `id`) as a terminal node.
//! 2. Pair adjacent nodes left to right; each parent hash is
//!    `digest(left.hash + right.hash)`.
//! 3. On a level with an odd count the last node is promoted to the next
//!    level unchanged. It is never paired with a copy of itself.
//! 4. Repeat until one node remains.
//!
//! # Example
//!
//! ```rust
//! use merkle_sync_core::merkle::{digest, HashTree};
//! use merkle_sync_core::models::Leaf;
//!
//! let tree = HashTree::from_leaves(vec![
//!     Leaf::new("c", "3"),
//!     Leaf::new("a", "1"),
//!     Leaf::new("b", "2"),
//! ]);
//! let expected = digest(&format!("{}{}", digest("12"), "3"));
//! assert_eq!(tree.root(), expected);
//! ```

use std::collections::BTreeMap;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::SyncError;
use crate::models::{Leaf, TreeSnapshot};

/// Root value of a tree that tracks no leaves.
///
/// Never collides with a real digest, which is always 64 hex characters.
pub const EMPTY_ROOT: &str = "empty";

/// Lowercase hex SHA-256 of `data`.
pub fn digest(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Leaf hash for a tracked file: `digest(path + content)`.
///
/// Including the path means two identical files at different locations
/// still contribute distinct leaves.
pub fn leaf_hash(path: &str, content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Content identity of a code fragment: `digest(content)`.
pub fn fragment_hash(content: &str) -> String {
    digest(content)
}

/// A node of the hash tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashNode {
    Leaf {
        hash: String,
        leaf_id: String,
    },
    Internal {
        hash: String,
        left: Box<HashNode>,
        right: Box<HashNode>,
    },
}

impl HashNode {
    fn terminal(leaf: &Leaf) -> Self {
        HashNode::Leaf {
            hash: leaf.hash.clone(),
            leaf_id: leaf.id.clone(),
        }
    }

    fn parent(left: HashNode, right: HashNode) -> Self {
        let hash = digest(&format!("{}{}", left.hash(), right.hash()));
        HashNode::Internal {
            hash,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            HashNode::Leaf { hash, .. } | HashNode::Internal { hash, .. } => hash,
        }
    }

    /// The leaf id, for terminal nodes.
    pub fn leaf_id(&self) -> Option<&str> {
        match self {
            HashNode::Leaf { leaf_id, .. } => Some(leaf_id),
            HashNode::Internal { .. } => None,
        }
    }

    /// Left and right children, for internal nodes.
    pub fn children(&self) -> Option<(&HashNode, &HashNode)> {
        match self {
            HashNode::Leaf { .. } => None,
            HashNode::Internal { left, right, .. } => Some((left, right)),
        }
    }

    /// Number of terminal nodes beneath (and including) this node.
    pub fn leaf_count(&self) -> usize {
        match self {
            HashNode::Leaf { .. } => 1,
            HashNode::Internal { left, right, .. } => left.leaf_count() + right.leaf_count(),
        }
    }
}

/// Builds a tree over `leaves` in the order given.
///
/// Callers must sort by `id` first for the root to be deterministic;
/// [`HashTree`] does this for you.
///
/// # Errors
///
/// [`SyncError::EmptyInput`] if `leaves` is empty.
pub fn build(leaves: &[Leaf]) -> Result<HashNode, SyncError> {
    if leaves.is_empty() {
        return Err(SyncError::EmptyInput);
    }

    let mut level: Vec<HashNode> = leaves.iter().map(HashNode::terminal).collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut nodes = level.into_iter();
        while let Some(left) = nodes.next() {
            match nodes.next() {
                Some(right) => next.push(HashNode::parent(left, right)),
                // Odd one out is promoted, not duplicated.
                None => next.push(left),
            }
        }
        level = next;
    }

    level.pop().ok_or(SyncError::EmptyInput)
}

/// Root hash of `leaves`, or [`EMPTY_ROOT`] when there are none.
pub fn root_of(leaves: &[Leaf]) -> String {
    match build(leaves) {
        Ok(node) => node.hash().to_string(),
        Err(_) => EMPTY_ROOT.to_string(),
    }
}

/// Result of an incremental update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    pub root: String,
    /// `false` when the update was suppressed and the root is unchanged.
    pub changed: bool,
}

/// A leaf set kept sorted by `id`, together with its current root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTree {
    leaves: Vec<Leaf>,
    root: String,
}

impl Default for HashTree {
    fn default() -> Self {
        Self::new()
    }
}

impl HashTree {
    /// An empty tree whose root is [`EMPTY_ROOT`].
    pub fn new() -> Self {
        Self {
            leaves: Vec::new(),
            root: EMPTY_ROOT.to_string(),
        }
    }

    /// Builds a tree from leaves in any order. Duplicate ids keep the last
    /// occurrence.
    pub fn from_leaves(leaves: Vec<Leaf>) -> Self {
        let mut by_id: BTreeMap<String, String> = BTreeMap::new();
        for leaf in leaves {
            by_id.insert(leaf.id, leaf.hash);
        }
        let leaves: Vec<Leaf> = by_id
            .into_iter()
            .map(|(id, hash)| Leaf { id, hash })
            .collect();
        let root = root_of(&leaves);
        Self { leaves, root }
    }

    /// Rebuilds from a persisted snapshot. The root is recomputed rather
    /// than trusted.
    pub fn from_snapshot(snapshot: &TreeSnapshot) -> Self {
        Self::from_leaves(snapshot.leaves.clone())
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn leaves(&self) -> &[Leaf] {
        &self.leaves
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Stored hash for `id`, if tracked.
    pub fn get(&self, id: &str) -> Option<&str> {
        self.position(id)
            .ok()
            .map(|idx| self.leaves[idx].hash.as_str())
    }

    /// Replaces or inserts the leaf for `id` and rebuilds the root.
    ///
    /// If `new_hash` equals the stored hash nothing is rebuilt and the old
    /// root is returned with `changed = false`.
    pub fn update(&mut self, id: &str, new_hash: &str) -> TreeChange {
        match self.position(id) {
            Ok(idx) if self.leaves[idx].hash == new_hash => {
                return TreeChange {
                    root: self.root.clone(),
                    changed: false,
                };
            }
            Ok(idx) => self.leaves[idx].hash = new_hash.to_string(),
            Err(idx) => self.leaves.insert(idx, Leaf::new(id, new_hash)),
        }
        self.rebuild()
    }

    /// Drops the leaf for `id`. Removing the last leaf yields [`EMPTY_ROOT`].
    pub fn remove(&mut self, id: &str) -> TreeChange {
        match self.position(id) {
            Ok(idx) => {
                self.leaves.remove(idx);
                self.rebuild()
            }
            Err(_) => TreeChange {
                root: self.root.clone(),
                changed: false,
            },
        }
    }

    /// Full node structure of the current tree.
    pub fn build(&self) -> Result<HashNode, SyncError> {
        build(&self.leaves)
    }

    /// Snapshot stamped with the current time.
    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            root: self.root.clone(),
            leaves: self.leaves.clone(),
            taken_at: Utc::now(),
        }
    }

    fn position(&self, id: &str) -> Result<usize, usize> {
        self.leaves.binary_search_by(|leaf| leaf.id.as_str().cmp(id))
    }

    fn rebuild(&mut self) -> TreeChange {
        let root = root_of(&self.leaves);
        let changed = root != self.root;
        self.root = root.clone();
        TreeChange { root, changed }
    }
}

/// Per-id differences between two leaf sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl LeafDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Every id that differs, in sorted order.
    pub fn changed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .added
            .iter()
            .chain(&self.modified)
            .chain(&self.removed)
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

/// Compares two leaf sets by id. Input order does not matter.
pub fn diff_leaves(old: &[Leaf], new: &[Leaf]) -> LeafDiff {
    let old_map: BTreeMap<&str, &str> = old.iter().map(|l| (l.id.as_str(), l.hash.as_str())).collect();
    let new_map: BTreeMap<&str, &str> = new.iter().map(|l| (l.id.as_str(), l.hash.as_str())).collect();

    let mut diff = LeafDiff::default();
    for (id, hash) in &new_map {
        match old_map.get(id) {
            None => diff.added.push(id.to_string()),
            Some(old_hash) if old_hash != hash => diff.modified.push(id.to_string()),
            Some(_) => {}
        }
    }
    for id in old_map.keys() {
        if !new_map.contains_key(id) {
            diff.removed.push(id.to_string());
        }
    }
    diff
}
