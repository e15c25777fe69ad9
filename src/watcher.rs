//! Change watching: the collaborator contract and the pipeline glue.
//!
//! Detecting raw filesystem events is the job of an external
//! [`ChangeWatcher`] implementation (an OS-level watch, an editor plugin,
//! a CI hook). This module only defines its interface and the
//! [`WatchPipeline`] that turns each event into a hash tree update.
//!
//! # Pipeline
//!
//! ```text
//! FileEvent ──▶ filter ──▶ leaf_hash(path + content) ──▶ HashTree::update/remove
//!                                                              │
//!                                          root changed? ──────┤
//!                                                              ▼
//!                                     save snapshot, enqueue dirty id, on_change(root)
//! ```
//!
//! Events are processed one at a time, fully, in delivery order, so the
//! pipeline is the single writer of the tree state and needs no locking.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use merkle_sync_core::merkle::{diff_leaves, leaf_hash};
use merkle_sync_core::HashTree;

use crate::scan::{build_tree, ProjectFilter};
use crate::state_store::TreeStateStore;

/// Kind of filesystem mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Create,
    Update,
    Delete,
}

/// One debounced filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>, kind: FileEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Source of filesystem events for a project.
///
/// The stream returned by [`subscribe`](ChangeWatcher::subscribe) is lazy,
/// unbounded in time, and cannot be restarted once it ends. Events for the
/// same path arrive in occurrence order; there is no ordering guarantee
/// between different paths.
pub trait ChangeWatcher: Send {
    /// Starts watching `root` for files with an allowed extension that
    /// match none of `ignore_patterns`.
    fn subscribe(
        &mut self,
        root: &Path,
        extensions: &[String],
        ignore_patterns: &[String],
    ) -> Result<mpsc::Receiver<FileEvent>>;

    /// Stops watching. The receiver then yields `None`.
    fn unsubscribe(&mut self);
}

/// Applies file events to the project's hash tree and persists the result.
pub struct WatchPipeline {
    filter: ProjectFilter,
    store: TreeStateStore,
    tree: HashTree,
}

impl WatchPipeline {
    /// Opens the pipeline, reconciling the saved baseline with the current
    /// state of the tree.
    ///
    /// Without a usable baseline every tracked file is marked dirty. With
    /// one, only files that changed while nobody was watching are.
    pub fn open(filter: ProjectFilter, store: TreeStateStore) -> Result<Self> {
        let tree = build_tree(&filter)?;

        let changed = match store.load() {
            Some(baseline) => diff_leaves(&baseline.leaves, tree.leaves()).changed_ids(),
            None => {
                info!(root = %filter.root().display(), "no usable baseline, full rebuild");
                tree.leaves().iter().map(|l| l.id.clone()).collect()
            }
        };

        store.save(&tree.snapshot())?;
        let added = store.enqueue_many(changed)?;
        info!(
            root = %tree.root(),
            leaves = tree.len(),
            newly_dirty = added,
            "tree state ready"
        );

        Ok(Self {
            filter,
            store,
            tree,
        })
    }

    /// Continues from the saved snapshot without rescanning. Falls back to
    /// [`open`](WatchPipeline::open) when there is no usable snapshot.
    pub fn resume(filter: ProjectFilter, store: TreeStateStore) -> Result<Self> {
        match store.load() {
            Some(snapshot) => Ok(Self {
                tree: HashTree::from_snapshot(&snapshot),
                filter,
                store,
            }),
            None => Self::open(filter, store),
        }
    }

    pub fn tree(&self) -> &HashTree {
        &self.tree
    }

    pub fn store(&self) -> &TreeStateStore {
        &self.store
    }

    pub fn filter(&self) -> &ProjectFilter {
        &self.filter
    }

    /// Applies one event. Returns the new root if it changed.
    ///
    /// Events for untracked paths, and updates that leave a file's hash
    /// unchanged, return `None` without touching the stored state.
    pub fn handle_event(&mut self, event: &FileEvent) -> Result<Option<String>> {
        let Some(id) = self.filter.relative_id(&event.path) else {
            return Ok(None);
        };
        if !self.filter.accepts(&id) {
            return Ok(None);
        }

        let change = match event.kind {
            FileEventKind::Create | FileEventKind::Update => {
                let path = self.filter.absolute(&id);
                match std::fs::read(&path) {
                    Ok(bytes) => self.tree.update(&id, &leaf_hash(&id, &bytes)),
                    // Gone before we got to it
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.tree.remove(&id),
                    Err(e) => {
                        return Err(e).with_context(|| format!("Failed to read {}", path.display()))
                    }
                }
            }
            FileEventKind::Delete => self.tree.remove(&id),
        };

        if !change.changed {
            debug!(id = %id, "no effective change");
            return Ok(None);
        }

        self.store.save(&self.tree.snapshot())?;
        self.store.enqueue_dirty(&id)?;
        debug!(id = %id, root = %change.root, "leaf changed");
        Ok(Some(change.root))
    }

    /// Consumes events until the stream ends, calling `on_change` with the
    /// new root after every effective change.
    ///
    /// A failure on one event is logged and does not stop the loop.
    pub async fn run<F>(&mut self, mut events: mpsc::Receiver<FileEvent>, mut on_change: F)
    where
        F: FnMut(&str),
    {
        while let Some(event) = events.recv().await {
            match self.handle_event(&event) {
                Ok(Some(root)) => on_change(&root),
                Ok(None) => {}
                Err(e) => warn!(path = %event.path.display(), error = %e, "failed to apply file event"),
            }
        }
        info!("change stream ended");
    }

    /// Subscribes `watcher` to this project and runs until the stream ends.
    pub async fn watch<W, F>(
        &mut self,
        watcher: &mut W,
        extensions: &[String],
        ignore: &[String],
        on_change: F,
    ) -> Result<()>
    where
        W: ChangeWatcher,
        F: FnMut(&str),
    {
        let root = self.filter.root().to_path_buf();
        let events = watcher.subscribe(&root, extensions, ignore)?;
        self.run(events, on_change).await;
        watcher.unsubscribe();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, WatchPipeline) {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.ts"), "let a = 1;").unwrap();
        fs::write(tmp.path().join("b.ts"), "let b = 2;").unwrap();
        let filter = ProjectFilter::new(tmp.path(), &["ts".to_string()], &[]).unwrap();
        let store = TreeStateStore::open(tmp.path().join(".msync")).unwrap();
        let pipeline = WatchPipeline::open(filter, store).unwrap();
        (tmp, pipeline)
    }

    #[test]
    fn test_open_without_baseline_marks_everything_dirty() {
        let (_tmp, pipeline) = setup();
        assert_eq!(pipeline.tree().len(), 2);
        assert_eq!(pipeline.store().dirty().pending.len(), 2);
        assert_eq!(
            pipeline.store().load().unwrap().root,
            pipeline.tree().root()
        );
    }

    #[test]
    fn test_reopen_only_marks_offline_changes() {
        let (tmp, pipeline) = setup();
        pipeline.store().drain_dirty().unwrap();
        let filter = pipeline.filter().clone();
        drop(pipeline);

        fs::write(tmp.path().join("b.ts"), "let b = 3;").unwrap();
        let store = TreeStateStore::open(tmp.path().join(".msync")).unwrap();
        let reopened = WatchPipeline::open(filter, store).unwrap();
        let pending: Vec<_> = reopened.store().dirty().pending.into_iter().collect();
        assert_eq!(pending, vec!["b.ts"]);
    }

    #[test]
    fn test_resume_uses_saved_snapshot() {
        let (tmp, pipeline) = setup();
        let root = pipeline.tree().root().to_string();
        let filter = pipeline.filter().clone();
        drop(pipeline);

        // Not rescanned: the new file is invisible until an event arrives
        fs::write(tmp.path().join("c.ts"), "let c = 3;").unwrap();
        let store = TreeStateStore::open(tmp.path().join(".msync")).unwrap();
        let mut resumed = WatchPipeline::resume(filter, store).unwrap();
        assert_eq!(resumed.tree().root(), root);

        let event = FileEvent::new(tmp.path().join("c.ts"), FileEventKind::Create);
        assert!(resumed.handle_event(&event).unwrap().is_some());
        assert_eq!(resumed.tree().len(), 3);
    }

    #[test]
    fn test_update_with_same_content_is_suppressed() {
        let (tmp, mut pipeline) = setup();
        let event = FileEvent::new(tmp.path().join("a.ts"), FileEventKind::Update);
        assert_eq!(pipeline.handle_event(&event).unwrap(), None);
    }

    #[test]
    fn test_update_changes_root_and_marks_dirty() {
        let (tmp, mut pipeline) = setup();
        pipeline.store().drain_dirty().unwrap();
        let before = pipeline.tree().root().to_string();

        fs::write(tmp.path().join("a.ts"), "let a = 42;").unwrap();
        let event = FileEvent::new(tmp.path().join("a.ts"), FileEventKind::Update);
        let root = pipeline.handle_event(&event).unwrap().unwrap();

        assert_ne!(root, before);
        assert!(pipeline.store().dirty().pending.contains("a.ts"));
        assert_eq!(pipeline.store().load().unwrap().root, root);
    }

    #[test]
    fn test_delete_and_untracked_paths() {
        let (tmp, mut pipeline) = setup();
        fs::remove_file(tmp.path().join("b.ts")).unwrap();
        let event = FileEvent::new(tmp.path().join("b.ts"), FileEventKind::Delete);
        assert!(pipeline.handle_event(&event).unwrap().is_some());
        assert_eq!(pipeline.tree().len(), 1);

        fs::write(tmp.path().join("notes.txt"), "hi").unwrap();
        let ignored = FileEvent::new(tmp.path().join("notes.txt"), FileEventKind::Create);
        assert_eq!(pipeline.handle_event(&ignored).unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_reports_only_real_changes() {
        let (tmp, mut pipeline) = setup();
        let (tx, rx) = mpsc::channel(8);

        fs::write(tmp.path().join("c.ts"), "let c = 3;").unwrap();
        tx.send(FileEvent::new(tmp.path().join("a.ts"), FileEventKind::Update))
            .await
            .unwrap();
        tx.send(FileEvent::new(tmp.path().join("c.ts"), FileEventKind::Create))
            .await
            .unwrap();
        drop(tx);

        let mut roots = Vec::new();
        pipeline.run(rx, |root| roots.push(root.to_string())).await;
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0], pipeline.tree().root());
    }
}
