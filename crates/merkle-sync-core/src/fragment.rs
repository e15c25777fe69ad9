//! Blank-line block fragmenter.
//!
//! Splits source text into [`Fragment`]s of kind [`FragmentKind::Block`]
//! without any language parsing. This is the fragment source used by the
//! CLI client; library callers with a real parser supply their own
//! fragments instead.
//!
//! # Algorithm
//!
//! 1. Group lines into paragraphs: runs of non-blank lines.
//! 2. Accumulate paragraphs into a block until adding the next one would
//!    make the block span more than `max_lines` lines.
//! 3. A single paragraph longer than `max_lines` is hard-split every
//!    `max_lines` lines.
//! 4. Each block's content is the exact source lines it spans, and its
//!    hash is [`fragment_hash`] of that content.
//!
//! # Example
//!
//! ```rust
//! use merkle_sync_core::fragment::split_blocks;
//!
//! let frags = split_blocks("src/main.rs", "fn a() {}\n\nfn b() {}\n", 80);
//! assert_eq!(frags.len(), 1);
//! assert_eq!(frags[0].line_range, (1, 3));
//! assert_eq!(frags[0].language_id, "rust");
//! ```

use crate::merkle::fragment_hash;
use crate::models::{Fragment, FragmentKind};

/// Split `text` into block fragments spanning at most `max_lines` lines.
///
/// Whitespace-only input produces no fragments.
pub fn split_blocks(path: &str, text: &str, max_lines: usize) -> Vec<Fragment> {
    let max_lines = max_lines.max(1);
    let lines: Vec<&str> = text.lines().collect();
    let language_id = language_for_path(path);

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for (start, end) in paragraphs(&lines) {
        // Oversized paragraph: flush and hard split
        if end - start + 1 > max_lines {
            if let Some(block) = current.take() {
                ranges.push(block);
            }
            let mut s = start;
            while s <= end {
                let e = (s + max_lines - 1).min(end);
                ranges.push((s, e));
                s = e + 1;
            }
            continue;
        }

        current = match current {
            None => Some((start, end)),
            Some((cs, _)) if end - cs + 1 <= max_lines => Some((cs, end)),
            Some(block) => {
                ranges.push(block);
                Some((start, end))
            }
        };
    }

    if let Some(block) = current {
        ranges.push(block);
    }

    ranges
        .into_iter()
        .map(|(s, e)| make_fragment(&lines[s..=e], s, e, &language_id))
        .collect()
}

/// Zero-based inclusive ranges of non-blank line runs.
fn paragraphs(lines: &[&str]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    for (i, line) in lines.iter().enumerate() {
        match (line.trim().is_empty(), start) {
            (false, None) => start = Some(i),
            (true, Some(s)) => {
                out.push((s, i - 1));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, lines.len() - 1));
    }
    out
}

fn make_fragment(lines: &[&str], start: usize, end: usize, language_id: &str) -> Fragment {
    let content = lines.join("\n");
    Fragment {
        hash: fragment_hash(&content),
        size: content.len(),
        content: Some(content),
        kind: FragmentKind::Block,
        name: None,
        line_range: (start as u32 + 1, end as u32 + 1),
        language_id: language_id.to_string(),
    }
}

/// Language identifier derived from a file extension.
pub fn language_for_path(path: &str) -> String {
    let file_name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let lang = match ext.as_str() {
        "rs" => "rust",
        "ts" | "tsx" | "mts" | "cts" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "py" | "pyi" => "python",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "rb" => "ruby",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "cs" => "csharp",
        "swift" => "swift",
        "php" => "php",
        "scala" => "scala",
        "" => "plaintext",
        other => other,
    };
    lang.to_string()
}
