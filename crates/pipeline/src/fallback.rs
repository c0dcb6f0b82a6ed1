//! Best-effort recovery of a job's artifact from disk.
//!
//! When a job ends without any result reference, the most recently
//! modified image written since the job's submission is looked up in
//! the known output directories. The match is heuristic: it may belong
//! to another job writing into the same folder.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use atelier_core::workflow::WorkflowGraph;
use walkdir::WalkDir;

/// Node and field holding the save-path prefix in the bundled templates.
const SAVE_NODE: &str = "3";
const SAVE_PREFIX_FIELD: &str = "filename_prefix";

const SCAN_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Base folder of the template's save prefix, e.g. `renders` for
/// `renders/2024-01-01/portrait`.
pub fn template_save_dir(graph: &WorkflowGraph) -> Option<PathBuf> {
    let prefix = graph.field(SAVE_NODE, SAVE_PREFIX_FIELD)?.as_str()?;
    let (base, _) = prefix.split_once(['/', '\\'])?;
    (!base.is_empty()).then(|| PathBuf::from(base))
}

/// Directories to scan, in precedence order: the template's own save
/// folder, then the configured directories.
pub fn scan_order(graph: &WorkflowGraph, configured: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = template_save_dir(graph).into_iter().collect();
    for dir in configured {
        if !dirs.contains(dir) {
            dirs.push(dir.clone());
        }
    }
    dirs
}

/// Source of the last-resort artifact lookup.
pub trait OutputScanner: Send + Sync {
    /// Newest image written at or after `since` in `dirs`, by precedence.
    fn latest_image(&self, dirs: &[PathBuf], since: SystemTime) -> Option<PathBuf>;
}

/// Scans the local filesystem with [`find_latest_image`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskScanner;

impl OutputScanner for DiskScanner {
    fn latest_image(&self, dirs: &[PathBuf], since: SystemTime) -> Option<PathBuf> {
        find_latest_image(dirs, since)
    }
}

/// Newest eligible image in the first directory that has one.
///
/// Only files modified at or after `since` count. Missing directories
/// are skipped.
pub fn find_latest_image(dirs: &[PathBuf], since: SystemTime) -> Option<PathBuf> {
    for dir in dirs {
        if !dir.is_dir() {
            tracing::debug!(dir = %dir.display(), "Fallback directory does not exist");
            continue;
        }
        if let Some(found) = latest_in_directory(dir, since) {
            tracing::warn!(
                dir = %dir.display(),
                path = %found.display(),
                "Recovered artifact via fallback scan",
            );
            return Some(found);
        }
    }
    None
}

fn latest_in_directory(dir: &Path, since: SystemTime) -> Option<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && has_image_extension(e.path()))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            (modified >= since).then(|| (modified, e.into_path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SCAN_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}
