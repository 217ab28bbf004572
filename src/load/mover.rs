//! Data Mover
//!
//! Places the files of a dump manifest into target directories. Content is
//! resolved at load time (original path, then the CM store), copied into a
//! per-load staging area and renamed into place once every file of the
//! operation is staged. With move optimization the staging hop is skipped
//! and files are written straight into the final directory.
//!
//! Placement is reconciled by file name, so replaying the same manifest
//! never duplicates data.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::cm::{checksum_file, ChangeManager};
use crate::dump::{FileSource, ManifestEntry, WriteMode};
use crate::error::{Error, Result};
use crate::warehouse::files::list_data_files;

/// Files placed by one write
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MoveStats {
    pub copied: usize,
    /// Already present with the expected content
    pub present: usize,
    /// Removed by Replace reconciliation
    pub removed: usize,
}

pub struct DataMover {
    staging_root: PathBuf,
    cm: Option<Arc<ChangeManager>>,
    move_optimization: bool,
}

impl DataMover {
    pub fn new(staging_root: PathBuf, cm: Option<Arc<ChangeManager>>, move_optimization: bool) -> Self {
        Self {
            staging_root,
            cm,
            move_optimization,
        }
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Locate the content of a manifest entry
    pub async fn resolve_source(&self, entry: &ManifestEntry) -> Result<PathBuf> {
        if has_content(&entry.original_path, &entry.checksum) {
            return Ok(entry.original_path.clone());
        }
        if let Some(cm) = &self.cm {
            if let Some(found) = cm.resolve(&entry.checksum, &entry.original_path).await? {
                return Ok(found.recycled_path);
            }
        }
        if let FileSource::Cm { path } = &entry.source {
            if has_content(path, &entry.checksum) {
                return Ok(path.clone());
            }
        }

        Err(Error::SourcePathMissing {
            file: entry.name.clone(),
            path: entry.original_path.clone(),
            checksum: entry.checksum.clone(),
        })
    }

    /// Bring `dir` in line with `files`
    ///
    /// Append adds the files that are not present by name; Replace also
    /// removes data files the manifest does not list.
    pub async fn write(
        &self,
        dir: &Path,
        files: &[&ManifestEntry],
        mode: WriteMode,
    ) -> Result<MoveStats> {
        fs::create_dir_all(dir)?;
        let mut stats = MoveStats::default();
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::new();

        for entry in files {
            let dest = dir.join(&entry.name);
            if has_content(&dest, &entry.checksum) {
                stats.present += 1;
                continue;
            }
            let source = self.resolve_source(entry).await?;

            if self.move_optimization {
                copy_atomic(&source, &dest)?;
            } else {
                let staging = self.staging_root.join(Uuid::new_v4().simple().to_string());
                fs::create_dir_all(&staging)?;
                let staged_path = staging.join(&entry.name);
                fs::copy(&source, &staged_path)?;
                staged.push((staged_path, dest));
            }
            stats.copied += 1;
        }

        for (staged_path, dest) in staged {
            fs::rename(&staged_path, &dest)?;
            if let Some(parent) = staged_path.parent() {
                if let Err(e) = fs::remove_dir(parent) {
                    tracing::debug!("Staging directory {} not removed: {}", parent.display(), e);
                }
            }
        }

        if mode == WriteMode::Replace {
            let wanted: HashSet<&str> = files.iter().map(|f| f.name.as_str()).collect();
            for existing in list_data_files(dir)? {
                let name = existing
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if !wanted.contains(name.as_str()) {
                    remove_if_present(&existing)?;
                    stats.removed += 1;
                }
            }
        }

        tracing::debug!(
            dir = %dir.display(),
            copied = stats.copied,
            present = stats.present,
            removed = stats.removed,
            "Data files placed"
        );
        Ok(stats)
    }

    /// Remove the staging area
    pub fn cleanup(&self) -> Result<()> {
        match fs::remove_dir_all(&self.staging_root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn has_content(path: &Path, checksum: &str) -> bool {
    path.is_file() && checksum_file(path).map_or(false, |c| c == checksum)
}

/// Copy through a hidden temporary name in the destination directory
fn copy_atomic(from: &Path, to: &Path) -> Result<()> {
    let name = to
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = to.with_file_name(format!(".{}.tmp", name));
    fs::copy(from, &tmp)?;
    fs::rename(&tmp, to)?;
    Ok(())
}

pub(crate) fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
