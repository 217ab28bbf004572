//! Change Management Store
//!
//! Content-addressed recycle area. Files that a destructive catalog
//! operation is about to make unreachable are moved here under their
//! SHA-256, so a dump written before the operation can still be loaded.
//! Recycling is serialized by the index lock: one entry per content.

use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Recycled file record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmEntry {
    /// Content checksum, suffixed `-N` when tie-broken
    pub checksum_key: String,
    pub checksum: String,
    pub recycled_path: PathBuf,
    pub original_path: PathBuf,
    pub size: u64,
    pub retention_deadline: DateTime<Utc>,
}

/// SHA-256 of a file's content, hex encoded
pub fn checksum_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn same_content(a: &Path, b: &Path) -> Result<bool> {
    let (ma, mb) = (fs::metadata(a)?, fs::metadata(b)?);
    if ma.len() != mb.len() {
        return Ok(false);
    }
    Ok(fs::read(a)? == fs::read(b)?)
}

/// Move `from` to `to`, copying when a rename is not possible
fn relocate(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    copy_into(from, to)?;
    fs::remove_file(from)?;
    Ok(())
}

fn copy_into(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = to.with_extension("tmp");
    fs::copy(from, &tmp)?;
    fs::rename(&tmp, to)?;
    Ok(())
}

type RawEntry = (String, String, String, String, i64, i64);

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_entry(raw: RawEntry) -> Result<CmEntry> {
    let (checksum_key, checksum, recycled, original, size, deadline) = raw;
    let retention_deadline = Utc
        .timestamp_millis_opt(deadline)
        .single()
        .ok_or_else(|| Error::State(format!("bad CM deadline for {}", checksum_key)))?;
    Ok(CmEntry {
        checksum_key,
        checksum,
        recycled_path: PathBuf::from(recycled),
        original_path: PathBuf::from(original),
        size: size as u64,
        retention_deadline,
    })
}

const SELECT_ENTRY: &str = "SELECT checksum_key, checksum, recycled_path, original_path, size, deadline FROM cm_entries";

/// Content-addressed recycle store with retention
pub struct ChangeManager {
    /// Directory holding recycled content
    files_dir: PathBuf,
    retention: chrono::Duration,
    /// Index connection; also serializes recycling
    conn: Mutex<Connection>,
}

impl ChangeManager {
    /// Create or open a CM root
    pub fn open(root: &Path, retention: Duration) -> Result<Self> {
        let files_dir = root.join("files");
        fs::create_dir_all(&files_dir)?;

        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| Error::Config(format!("CM retention out of range: {}", e)))?;

        let conn = Connection::open(root.join("cm_index.db"))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cm_entries (
                checksum_key TEXT PRIMARY KEY,
                checksum TEXT NOT NULL,
                recycled_path TEXT NOT NULL,
                original_path TEXT NOT NULL,
                size INTEGER NOT NULL,
                deadline INTEGER NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_cm_entries_checksum
                ON cm_entries(checksum);
            "#,
        )?;

        Ok(Self {
            files_dir,
            retention,
            conn: Mutex::new(conn),
        })
    }

    /// Location of recycled content for a key
    fn cm_path(&self, key: &str) -> PathBuf {
        let prefix = key.get(0..2).unwrap_or("xx");
        self.files_dir.join(prefix).join(key)
    }

    /// Preserve `path` in the store and remove it from its original location
    ///
    /// Content already present is not stored twice; its deadline is pushed
    /// out instead. Different content under the same checksum gets the next
    /// free `checksum-N` key.
    pub async fn recycle(&self, path: &Path) -> Result<CmEntry> {
        self.store(path, true).await
    }

    /// Preserve a copy of `path`, leaving the original in place
    ///
    /// Used before operations that move files to a new root, so content
    /// referenced under the old path stays resolvable.
    pub async fn preserve(&self, path: &Path) -> Result<CmEntry> {
        self.store(path, false).await
    }

    async fn store(&self, path: &Path, consume: bool) -> Result<CmEntry> {
        let conn = self.conn.lock().await;

        let checksum = checksum_file(path)?;
        let size = fs::metadata(path)?.len();
        let deadline = Utc::now() + self.retention;

        let mut n = 0u32;
        loop {
            let key = if n == 0 {
                checksum.clone()
            } else {
                format!("{}-{}", checksum, n)
            };

            let existing = conn
                .query_row(
                    &format!("{} WHERE checksum_key = ?1", SELECT_ENTRY),
                    params![key],
                    row_to_entry,
                )
                .optional()?
                .map(into_entry)
                .transpose()?;

            match existing {
                Some(entry) if entry.recycled_path.exists() => {
                    if !same_content(&entry.recycled_path, path)? {
                        n += 1;
                        continue;
                    }
                    let deadline = deadline.max(entry.retention_deadline);
                    conn.execute(
                        "UPDATE cm_entries SET deadline = ?2 WHERE checksum_key = ?1",
                        params![key, deadline.timestamp_millis()],
                    )?;
                    if consume {
                        fs::remove_file(path)?;
                    }
                    debug!("Recycled {:?} deduplicated against {}", path, key);
                    return Ok(CmEntry {
                        retention_deadline: deadline,
                        ..entry
                    });
                }
                _ => {
                    let recycled_path = self.cm_path(&key);
                    if consume {
                        relocate(path, &recycled_path)?;
                    } else {
                        copy_into(path, &recycled_path)?;
                    }
                    conn.execute(
                        r#"
                        INSERT INTO cm_entries (checksum_key, checksum, recycled_path, original_path, size, deadline)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                        ON CONFLICT(checksum_key) DO UPDATE SET
                            recycled_path = ?3, original_path = ?4, size = ?5, deadline = ?6
                        "#,
                        params![
                            key,
                            checksum,
                            recycled_path.to_string_lossy(),
                            path.to_string_lossy(),
                            size as i64,
                            deadline.timestamp_millis(),
                        ],
                    )?;
                    debug!("Recycled {:?} as {} ({} bytes)", path, key, size);
                    return Ok(CmEntry {
                        checksum_key: key,
                        checksum,
                        recycled_path,
                        original_path: path.to_path_buf(),
                        size,
                        retention_deadline: deadline,
                    });
                }
            }
        }
    }

    /// Recycle every regular file under `dir`, then remove the directory
    pub async fn recycle_dir(&self, dir: &Path) -> Result<Vec<CmEntry>> {
        let mut entries = Vec::new();
        let files = match list_files_recursive(dir) {
            Ok(files) => files,
            Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e),
        };
        for file in files {
            entries.push(self.recycle(&file).await?);
        }
        fs::remove_dir_all(dir)?;
        Ok(entries)
    }

    /// Find retained content by checksum
    ///
    /// When several entries share the checksum, the one recycled from
    /// `original` wins, otherwise the untie-broken key.
    pub async fn resolve(&self, checksum: &str, original: &Path) -> Result<Option<CmEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE checksum = ?1 ORDER BY length(checksum_key), checksum_key",
            SELECT_ENTRY
        ))?;
        let rows = stmt.query_map(params![checksum], row_to_entry)?;
        let raw: Vec<_> = rows.collect::<std::result::Result<_, _>>()?;

        let mut candidates = Vec::with_capacity(raw.len());
        for r in raw {
            let entry = into_entry(r)?;
            if entry.recycled_path.exists() {
                candidates.push(entry);
            }
        }

        if candidates.is_empty() {
            return Ok(None);
        }
        let preferred = candidates
            .iter()
            .position(|e| e.original_path == original)
            .unwrap_or(0);
        Ok(Some(candidates.swap_remove(preferred)))
    }

    /// Delete content whose retention deadline has passed
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let expired: Vec<CmEntry> = {
            let mut stmt = conn.prepare(&format!("{} WHERE deadline < ?1", SELECT_ENTRY))?;
            let rows = stmt.query_map(params![now.timestamp_millis()], row_to_entry)?;
            let raw: Vec<_> = rows.collect::<std::result::Result<_, _>>()?;
            raw.into_iter().map(into_entry).collect::<Result<_>>()?
        };

        for entry in &expired {
            match fs::remove_file(&entry.recycled_path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            conn.execute(
                "DELETE FROM cm_entries WHERE checksum_key = ?1",
                params![entry.checksum_key],
            )?;
        }

        if !expired.is_empty() {
            tracing::info!("Purged {} expired CM entries", expired.len());
        }
        Ok(expired.len())
    }

    /// Number of retained entries
    pub async fn len(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cm_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Regular files under `dir`, sorted by path
pub fn list_files_recursive(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_recycle_moves_and_resolves() {
        let dir = tempdir().unwrap();
        let cm = ChangeManager::open(&dir.path().join("cm"), Duration::from_secs(3600)).unwrap();
        let file = dir.path().join("wh/t/data_0");
        write(&file, "ten\n");

        let entry = cm.recycle(&file).await.unwrap();
        assert!(!file.exists());
        assert_eq!(fs::read_to_string(&entry.recycled_path).unwrap(), "ten\n");
        assert_eq!(entry.checksum_key, entry.checksum);

        let found = cm.resolve(&entry.checksum, &file).await.unwrap().unwrap();
        assert_eq!(found.recycled_path, entry.recycled_path);
        assert!(cm.resolve("deadbeef", &file).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_content_is_deduplicated() {
        let dir = tempdir().unwrap();
        let cm = ChangeManager::open(&dir.path().join("cm"), Duration::from_secs(3600)).unwrap();
        let a = dir.path().join("wh/t1/data_0");
        let b = dir.path().join("wh/t2/data_0");
        write(&a, "same\n");
        write(&b, "same\n");

        let first = cm.recycle(&a).await.unwrap();
        let second = cm.recycle(&b).await.unwrap();
        assert_eq!(first.checksum_key, second.checksum_key);
        assert!(second.retention_deadline >= first.retention_deadline);
        assert!(!b.exists());
        assert_eq!(cm.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_checksum_collision_is_tie_broken() {
        let dir = tempdir().unwrap();
        let cm = ChangeManager::open(&dir.path().join("cm"), Duration::from_secs(3600)).unwrap();
        let a = dir.path().join("wh/a");
        write(&a, "one\n");
        let first = cm.recycle(&a).await.unwrap();

        // Corrupt the stored copy so the next file with that checksum differs
        fs::write(&first.recycled_path, "not one\n").unwrap();
        write(&a, "one\n");
        let second = cm.recycle(&a).await.unwrap();

        assert_eq!(second.checksum_key, format!("{}-1", first.checksum));
        assert_eq!(fs::read_to_string(&first.recycled_path).unwrap(), "not one\n");
        assert_eq!(fs::read_to_string(&second.recycled_path).unwrap(), "one\n");
        assert_eq!(cm.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_preserve_keeps_original() {
        let dir = tempdir().unwrap();
        let cm = ChangeManager::open(&dir.path().join("cm"), Duration::from_secs(3600)).unwrap();
        let file = dir.path().join("wh/t/data_0");
        write(&file, "kept\n");

        let entry = cm.preserve(&file).await.unwrap();
        assert!(file.exists());
        assert_eq!(fs::read_to_string(&entry.recycled_path).unwrap(), "kept\n");

        // recycling the same content afterwards dedups against the copy
        let again = cm.recycle(&file).await.unwrap();
        assert_eq!(again.checksum_key, entry.checksum_key);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_purge_respects_deadline() {
        let dir = tempdir().unwrap();
        let cm = ChangeManager::open(&dir.path().join("cm"), Duration::from_secs(3600)).unwrap();
        let file = dir.path().join("wh/t/data_0");
        write(&file, "x\n");
        let entry = cm.recycle(&file).await.unwrap();

        assert_eq!(cm.purge_expired(Utc::now()).await.unwrap(), 0);
        assert!(entry.recycled_path.exists());

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(cm.purge_expired(later).await.unwrap(), 1);
        assert!(!entry.recycled_path.exists());
        assert!(cm.resolve(&entry.checksum, &file).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recycle_dir() {
        let dir = tempdir().unwrap();
        let cm = ChangeManager::open(&dir.path().join("cm"), Duration::from_secs(3600)).unwrap();
        let table = dir.path().join("wh/t");
        write(&table.join("p=1/data_0"), "a\n");
        write(&table.join("p=2/data_0"), "b\n");

        let entries = cm.recycle_dir(&table).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!table.exists());
        assert!(cm.recycle_dir(&table).await.unwrap().is_empty());
    }
}
