//! Project scanning: walk the source tree and hash every tracked file.
//!
//! A file is tracked when its extension is in the allow-list and its
//! project-relative path matches none of the ignore globs (`**` and `*`
//! supported). VCS, build, and state directories are always ignored.
//!
//! Leaf ids are project-relative paths with `/` separators; leaf hashes
//! are [`leaf_hash`]`(id, bytes)`.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use merkle_sync_core::fragment::split_blocks;
use merkle_sync_core::merkle::leaf_hash;
use merkle_sync_core::models::{Fragment, Leaf};
use merkle_sync_core::HashTree;

use crate::config::ProjectConfig;

/// Decides which paths under a project root are tracked.
#[derive(Clone)]
pub struct ProjectFilter {
    root: PathBuf,
    extensions: HashSet<String>,
    ignore: GlobSet,
}

impl ProjectFilter {
    pub fn new(root: &Path, extensions: &[String], ignore_globs: &[String]) -> Result<Self> {
        let mut patterns = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
            ".msync/**".to_string(),
        ];
        patterns.extend(ignore_globs.iter().cloned());

        Ok(Self {
            root: root.to_path_buf(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            ignore: build_globset(&patterns)?,
        })
    }

    /// Filter for `[project]`. A state directory inside the root is ignored
    /// wherever it is configured.
    pub fn from_config(project: &ProjectConfig) -> Result<Self> {
        let mut ignore = project.ignore_globs.clone();
        let state_path = project.state_path();
        if let Ok(relative) = state_path.strip_prefix(&project.root) {
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            if !parts.is_empty() {
                ignore.push(format!("{}/**", parts.join("/")));
            }
        }
        Self::new(&project.root, &project.extensions, &ignore)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Project-relative id for `path`, or `None` if it lies outside the root.
    pub fn relative_id(&self, path: &Path) -> Option<String> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root).ok()?
        } else {
            path
        };
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    /// Whether a relative id passes the extension allow-list and ignore set.
    pub fn accepts(&self, id: &str) -> bool {
        let ext = Path::new(id)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        match ext {
            Some(ext) if self.extensions.contains(&ext) => !self.ignore.is_match(id),
            _ => false,
        }
    }

    pub fn absolute(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }
}

/// A tracked file and its leaf hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub id: String,
    pub path: PathBuf,
    pub hash: String,
}

impl ScannedFile {
    pub fn leaf(&self) -> Leaf {
        Leaf::new(self.id.clone(), self.hash.clone())
    }
}

/// Walks the project root and hashes every tracked file, sorted by id.
pub fn scan_project(filter: &ProjectFilter) -> Result<Vec<ScannedFile>> {
    let root = filter.root();
    if !root.exists() {
        bail!("Project root does not exist: {}", root.display());
    }

    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Some(id) = filter.relative_id(path) else {
            continue;
        };
        if !filter.accepts(&id) {
            continue;
        }

        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        files.push(ScannedFile {
            hash: leaf_hash(&id, &bytes),
            id,
            path: path.to_path_buf(),
        });
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(files)
}

/// Full rebuild: scan and build a tree from scratch.
pub fn build_tree(filter: &ProjectFilter) -> Result<HashTree> {
    let files = scan_project(filter)?;
    Ok(HashTree::from_leaves(
        files.iter().map(ScannedFile::leaf).collect(),
    ))
}

/// Block fragments for each listed file that still exists.
///
/// Missing files (deleted since they were marked) contribute nothing.
pub fn fragments_for<'a, I>(filter: &ProjectFilter, ids: I, max_lines: usize) -> Result<Vec<Fragment>>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut fragments = Vec::new();
    for id in ids {
        let path = filter.absolute(id);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let text = String::from_utf8_lossy(&bytes);
        fragments.extend(split_blocks(id, &text, max_lines));
    }
    Ok(fragments)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
