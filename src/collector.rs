//! Maps files under the watch root to the configured subdirectory that governs them.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::settings::ImportConfiguration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedFile {
    pub subdirectory_key: String,
    pub absolute_path: PathBuf,
}

pub type CollectedFiles = BTreeMap<String, Vec<CollectedFile>>;

/// Total number of files across all subdirectories.
pub fn file_count(files: &CollectedFiles) -> usize {
    files.values().map(Vec::len).sum()
}

/// Full scan: the immediate (non-directory) entries of every configured
/// subdirectory that exists. Missing or empty subdirectories are omitted.
pub fn collect_all(root: &Path, config: &ImportConfiguration) -> Result<CollectedFiles> {
    let mut collected = CollectedFiles::new();

    for key in config.policies.keys() {
        let dir = root.join(key);
        if !dir.is_dir() {
            debug!(subdirectory = %key, "subdirectory missing, skipped");
            continue;
        }

        let mut files: Vec<CollectedFile> = std::fs::read_dir(&dir)?
            .flatten()
            .filter(|entry| entry.file_type().map_or(false, |t| !t.is_dir()))
            .map(|entry| CollectedFile {
                subdirectory_key: key.clone(),
                absolute_path: entry.path(),
            })
            .collect();

        if files.is_empty() {
            continue;
        }
        files.sort_by(|a, b| a.absolute_path.cmp(&b.absolute_path));
        collected.insert(key.clone(), files);
    }

    Ok(collected)
}

/// Event mode: the first path component below `root` names the subdirectory.
pub fn collect_one(root: &Path, event_path: &Path) -> Result<CollectedFiles> {
    let resolution_error = |reason: &str| Error::PathResolution {
        path: event_path.to_path_buf(),
        root: root.to_path_buf(),
        reason: reason.to_string(),
    };

    let relative = event_path
        .strip_prefix(root)
        .map_err(|_| resolution_error("not under the watch root"))?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            // ".." could climb back out of the root
            _ => return Err(resolution_error("path leaves the watch root")),
        }
    }
    let mut components = parts.into_iter();
    let key = components
        .next()
        .ok_or_else(|| resolution_error("path is the watch root itself"))?;
    if components.next().is_none() {
        return Err(resolution_error("file is not inside a subdirectory"));
    }

    let key = key.to_string_lossy().into_owned();
    let mut collected = CollectedFiles::new();
    collected.insert(
        key.clone(),
        vec![CollectedFile {
            subdirectory_key: key,
            absolute_path: event_path.to_path_buf(),
        }],
    );
    Ok(collected)
}
