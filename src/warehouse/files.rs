//! Data Files
//!
//! Table and partition data are line-oriented text files. Names starting
//! with `.` or `_` are bookkeeping and never count as data.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::cm::checksum_file;
use crate::error::Result;
use crate::event::FileRef;

/// Whether a file name denotes table data
pub fn is_data_file_name(name: &str) -> bool {
    !name.starts_with('.') && !name.starts_with('_')
}

/// Data files directly inside `dir`, sorted; a missing dir has none
pub fn list_data_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_file() && is_data_file_name(&name.to_string_lossy()) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Reference to an existing data file
pub fn file_ref(path: &Path) -> Result<FileRef> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(FileRef {
        name,
        path: path.to_path_buf(),
        checksum: checksum_file(path)?,
        size: fs::metadata(path)?.len(),
    })
}

/// Write rows as a new data file in `dir`
pub fn write_data_file(dir: &Path, rows: &[&str]) -> Result<FileRef> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("data_{}", Uuid::new_v4().simple()));

    let mut content = String::new();
    for row in rows {
        content.push_str(row);
        content.push('\n');
    }
    fs::write(&path, content)?;

    file_ref(&path)
}

/// All rows stored under `dir`, including partition subdirectories, sorted
pub fn read_rows(dir: &Path) -> Result<Vec<String>> {
    let mut rows = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_data_file_name(&name) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                pending.push(entry.path());
            } else {
                let content = fs::read_to_string(entry.path())?;
                rows.extend(content.lines().map(str::to_string));
            }
        }
    }

    rows.sort();
    Ok(rows)
}
