//! Local filesystem id store.
//!
//! Records are appended as JSON Lines and synced before `mark_seen`
//! returns. The file is only ever rewritten as a whole (prune, compaction),
//! and then atomically: write to a temp file, sync, rename, sync the
//! directory. A crash therefore leaves either the old or the new file, plus
//! at most one torn trailing line, which is skipped on load.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::GlobalId;
use crate::storage::{ExpiryBasis, IdStore, SeenRecord, SeenSet, StoreStats};

/// Rewrite the file on open once it holds this many superseded lines.
const COMPACT_SLACK: usize = 1024;

/// One line of the store file.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    source: String,
    id: String,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl StoredRecord {
    fn new(id: &GlobalId, record: &SeenRecord) -> Self {
        Self {
            source: id.source.clone(),
            id: id.id.clone(),
            first_seen: record.first_seen,
            last_seen: record.last_seen,
        }
    }

    fn into_parts(self) -> (GlobalId, SeenRecord) {
        (
            GlobalId {
                source: self.source,
                id: self.id,
            },
            SeenRecord {
                first_seen: self.first_seen,
                last_seen: self.last_seen,
            },
        )
    }
}

struct Inner {
    seen: SeenSet,
    /// Append handle; `None` after the file was replaced but not yet reopened
    file: Option<File>,
    /// Touched records not yet written
    dirty: HashSet<GlobalId>,
    /// A previous append failed midway; start the next one on a fresh line
    torn: bool,
}

/// JSON Lines backed [`IdStore`].
pub struct LocalIdStore {
    path: PathBuf,
    basis: ExpiryBasis,
    inner: Mutex<Inner>,
}

impl LocalIdStore {
    /// Open (or create) the store file and load its records.
    pub async fn open(path: impl Into<PathBuf>, basis: ExpiryBasis) -> Result<Self> {
        let path = path.into();
        ensure_dir(&path).await?;

        let (seen, lines) = load(&path).await?;
        log::info!(
            "Loaded {} seen ids from {} ({} lines)",
            seen.len(),
            path.display(),
            lines
        );

        if lines > seen.len() + COMPACT_SLACK {
            log::info!("Compacting {}", path.display());
            write_snapshot(&path, &seen).await?;
        }

        let file = open_append(&path).await?;
        sync_parent(&path).await?;
        Ok(Self {
            path,
            basis,
            inner: Mutex::new(Inner {
                seen,
                file: Some(file),
                dirty: HashSet::new(),
                torn: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append lines and sync them to disk.
    async fn append(&self, inner: &mut Inner, lines: &[StoredRecord]) -> Result<()> {
        let mut buf = Vec::new();
        if inner.torn {
            buf.push(b'\n');
        }
        for line in lines {
            serde_json::to_writer(&mut buf, line)?;
            buf.push(b'\n');
        }

        let file = match inner.file.take() {
            Some(file) => file,
            None => open_append(&self.path).await?,
        };
        let file = inner.file.insert(file);
        let written = match file.write_all(&buf).await {
            Ok(()) => file.sync_data().await,
            Err(e) => Err(e),
        };

        match written {
            Ok(()) => {
                inner.torn = false;
                Ok(())
            }
            Err(e) => {
                inner.torn = true;
                Err(AppError::store(format!(
                    "append to {} failed: {e}",
                    self.path.display()
                )))
            }
        }
    }
}

#[async_trait]
impl IdStore for LocalIdStore {
    async fn is_seen(&self, id: &GlobalId) -> Result<bool> {
        Ok(self.inner.lock().await.seen.contains(id))
    }

    async fn mark_seen(&self, id: &GlobalId, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.seen.contains(id) {
            return Ok(());
        }

        let record = SeenRecord {
            first_seen: at,
            last_seen: at,
        };
        self.append(&mut inner, &[StoredRecord::new(id, &record)])
            .await?;
        inner.seen.insert_new(id, at);
        Ok(())
    }

    async fn touch(&self, id: &GlobalId, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.seen.touch(id, at) && self.basis == ExpiryBasis::LastSeen {
            inner.dirty.insert(id.clone());
        }
        Ok(())
    }

    async fn prune(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let retained = inner.seen.retained(before, self.basis);
        let removed = inner.seen.len() - retained.len();
        if removed == 0 {
            return Ok(0);
        }

        // Memory is only updated once the new file is in place. From the
        // rename on, the old handle points at an unlinked inode.
        write_snapshot(&self.path, &retained).await?;
        inner.file = None;
        inner.seen = retained;
        inner.dirty.clear();
        inner.torn = false;
        inner.file = Some(open_append(&self.path).await?);
        sync_parent(&self.path).await?;

        log::info!(
            "Pruned {} records seen before {} from {}",
            removed,
            before.to_rfc3339(),
            self.path.display()
        );
        Ok(removed)
    }

    async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.dirty.is_empty() {
            return Ok(());
        }

        let lines: Vec<StoredRecord> = inner
            .dirty
            .iter()
            .filter_map(|id| inner.seen.get(id).map(|r| StoredRecord::new(id, r)))
            .collect();
        self.append(&mut inner, &lines).await?;
        inner.dirty.clear();
        log::debug!("Flushed {} touched records", lines.len());
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(self.inner.lock().await.seen.stats())
    }
}

/// Ensure parent directory exists.
async fn ensure_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

async fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

/// Read all records, returning the folded index and the number of lines read.
async fn load(path: &Path) -> Result<(SeenSet, usize)> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((SeenSet::default(), 0)),
        Err(e) => return Err(AppError::Io(e)),
    };

    let mut seen = SeenSet::default();
    let mut lines = 0;
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        lines += 1;
        match serde_json::from_str::<StoredRecord>(line) {
            Ok(record) => {
                let (id, record) = record.into_parts();
                seen.merge(id, record);
            }
            Err(e) => log::warn!(
                "Skipping unreadable line {} in {}: {}",
                number + 1,
                path.display(),
                e
            ),
        }
    }
    Ok((seen, lines))
}

/// Replace the store file with one line per record (write to temp, then rename).
///
/// The caller syncs the directory once it has reopened its append handle.
async fn write_snapshot(path: &Path, seen: &SeenSet) -> Result<()> {
    let mut records: Vec<StoredRecord> = seen
        .iter()
        .map(|(id, record)| StoredRecord::new(id, record))
        .collect();
    records.sort_by(|a, b| a.first_seen.cmp(&b.first_seen));

    let mut bytes = Vec::new();
    for record in &records {
        serde_json::to_writer(&mut bytes, record)?;
        bytes.push(b'\n');
    }

    let tmp = path.with_extension("jsonl.tmp");
    let mut file = File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(unix)]
async fn sync_parent(path: &Path) -> Result<()> {
    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    File::open(parent).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}
