//! ---
//! hatch_section: "01-core-functionality"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Staging directory management."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use hatch_release::ReleaseAsset;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Directory owned by the coordinator for downloaded artifacts.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    /// Where the artifact of `asset` is staged.
    pub fn artifact_path(&self, asset: &ReleaseAsset) -> PathBuf {
        self.root.join(asset.file_name())
    }

    /// Whether `path` lies directly inside the staging directory.
    pub fn contains(&self, path: &Path) -> bool {
        path.parent() == Some(self.root.as_path())
    }

    /// Remove everything inside the staging directory, returning the number
    /// of entries removed. A missing directory counts as already clean.
    pub fn clear(&self) -> io::Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let entries: Vec<PathBuf> = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.into_path())
            .collect();
        let mut removed = 0;
        for path in entries {
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed removing staged entry");
                    return Err(err);
                }
            }
        }
        debug!(root = %self.root.display(), removed, "staging directory cleared");
        Ok(removed)
    }
}
