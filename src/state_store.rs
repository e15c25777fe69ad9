//! Durable tree snapshot and dirty queue for the watching side.
//!
//! Two JSON files live in the project's state directory:
//!
//! | File | Contents |
//! |------|----------|
//! | `snapshot.json` | [`TreeSnapshot`]: root, sorted leaves, timestamp |
//! | `dirty.json` | [`DirtyQueue`]: ids changed since the last sync |
//!
//! Every write goes to a temporary file in the same directory and is then
//! renamed over the target, so a reader sees either the old file or the
//! new one, never a partial write.
//!
//! A missing or unreadable snapshot is not an error: [`TreeStateStore::load`]
//! returns `None` and the caller rebuilds from a full scan.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use merkle_sync_core::merkle::root_of;
use merkle_sync_core::models::{DirtyQueue, TreeSnapshot};

const SNAPSHOT_FILE: &str = "snapshot.json";
const DIRTY_FILE: &str = "dirty.json";

/// Single-writer store for one project's local sync state.
pub struct TreeStateStore {
    dir: PathBuf,
}

impl TreeStateStore {
    /// Opens (and creates if needed) the state directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state dir: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads the last saved snapshot.
    ///
    /// Returns `None` when there is no snapshot, when it cannot be parsed,
    /// or when its leaves do not reproduce its root.
    pub fn load(&self) -> Option<TreeSnapshot> {
        let snapshot: TreeSnapshot = read_json(&self.dir.join(SNAPSHOT_FILE))?;

        let sorted = snapshot.leaves.windows(2).all(|w| w[0].id < w[1].id);
        if !sorted || root_of(&snapshot.leaves) != snapshot.root {
            warn!(dir = %self.dir.display(), "snapshot is inconsistent, ignoring it");
            return None;
        }
        Some(snapshot)
    }

    /// Atomically replaces the stored snapshot.
    pub fn save(&self, snapshot: &TreeSnapshot) -> Result<()> {
        write_json_atomic(&self.dir, SNAPSHOT_FILE, snapshot)?;
        debug!(root = %snapshot.root, leaves = snapshot.leaves.len(), "snapshot saved");
        Ok(())
    }

    /// Current dirty queue. An unreadable queue is reported as empty.
    pub fn dirty(&self) -> DirtyQueue {
        read_json(&self.dir.join(DIRTY_FILE)).unwrap_or_default()
    }

    /// Marks `id` as changed. Returns `false` if it was already pending.
    pub fn enqueue_dirty(&self, id: &str) -> Result<bool> {
        let mut queue = self.dirty();
        let added = queue.enqueue(id);
        if added {
            write_json_atomic(&self.dir, DIRTY_FILE, &queue)?;
        }
        Ok(added)
    }

    /// Marks every id in `ids` as changed with a single write.
    pub fn enqueue_many<I, S>(&self, ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut queue = self.dirty();
        let mut added = 0;
        for id in ids {
            if queue.enqueue(id) {
                added += 1;
            }
        }
        if added > 0 {
            write_json_atomic(&self.dir, DIRTY_FILE, &queue)?;
        }
        Ok(added)
    }

    /// Empties the queue, advances `last_synced_at`, and returns what was pending.
    pub fn drain_dirty(&self) -> Result<BTreeSet<String>> {
        let mut queue = self.dirty();
        let drained = queue.drain();
        write_json_atomic(&self.dir, DIRTY_FILE, &queue)?;
        Ok(drained)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read state file");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt state file");
            None
        }
    }
}

fn write_json_atomic<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let target = dir.join(name);
    let bytes = serde_json::to_vec_pretty(value)?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&target)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {}", target.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use merkle_sync_core::models::Leaf;
    use merkle_sync_core::HashTree;
    use tempfile::TempDir;

    fn tree() -> HashTree {
        HashTree::from_leaves(vec![Leaf::new("b.rs", "2"), Leaf::new("a.rs", "1")])
    }

    #[test]
    fn test_load_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = TreeStateStore::open(tmp.path().join("state")).unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let tmp = TempDir::new().unwrap();
        let store = TreeStateStore::open(tmp.path()).unwrap();
        let snap = tree().snapshot();
        store.save(&snap).unwrap();
        assert_eq!(store.load().unwrap(), snap);
    }

    #[test]
    fn test_save_replaces_previous() {
        let tmp = TempDir::new().unwrap();
        let store = TreeStateStore::open(tmp.path()).unwrap();
        let mut t = tree();
        store.save(&t.snapshot()).unwrap();
        t.update("c.rs", "3");
        store.save(&t.snapshot()).unwrap();
        assert_eq!(store.load().unwrap().leaves.len(), 3);

        // Only the target file remains; temp files were renamed away
        let files: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_corrupt_snapshot_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = TreeStateStore::open(tmp.path()).unwrap();
        std::fs::write(tmp.path().join(SNAPSHOT_FILE), b"{not json").unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn test_tampered_root_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = TreeStateStore::open(tmp.path()).unwrap();
        let mut snap = tree().snapshot();
        snap.root = "0".repeat(64);
        store.save(&snap).unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn test_dirty_queue_enqueue_and_drain() {
        let tmp = TempDir::new().unwrap();
        let store = TreeStateStore::open(tmp.path()).unwrap();

        assert!(store.enqueue_dirty("a.rs").unwrap());
        assert!(!store.enqueue_dirty("a.rs").unwrap());
        assert_eq!(store.enqueue_many(["b.rs", "a.rs"]).unwrap(), 1);
        assert_eq!(store.dirty().pending.len(), 2);

        let drained = store.drain_dirty().unwrap();
        assert_eq!(drained.into_iter().collect::<Vec<_>>(), vec!["a.rs", "b.rs"]);
        let after = store.dirty();
        assert!(after.is_empty());
        assert!(after.last_synced_at.is_some());
    }
}
