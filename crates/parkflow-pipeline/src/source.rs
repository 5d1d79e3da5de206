//! Where snapshots come from.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};

/// One full snapshot of the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Identifies the snapshot; an id is ingested at most once.
    pub id: String,
    /// Hex SHA-256 of the body.
    pub digest: String,
    pub body: String,
    /// File to remove once the snapshot is ingested.
    pub cleanup: Option<PathBuf>,
    /// Why the body could not be read; such a snapshot is reported as
    /// malformed and never ingested.
    pub unreadable: Option<String>,
}

impl Snapshot {
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            id: id.into(),
            digest: hex::encode(Sha256::digest(body.as_bytes())),
            body,
            cleanup: None,
            unreadable: None,
        }
    }

    pub fn unreadable(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            unreadable: Some(reason.into()),
            ..Self::new(id, "")
        }
    }

    pub fn with_cleanup(mut self, path: impl Into<PathBuf>) -> Self {
        self.cleanup = Some(path.into());
        self
    }
}

#[async_trait]
pub trait SnapshotSource: Send {
    /// Human readable origin, for logs.
    fn describe(&self) -> String;

    /// Fetch whatever is new since the last poll, oldest first.
    async fn poll(&mut self) -> PipelineResult<Vec<Snapshot>>;
}

/// Reads `*.json` snapshot files from a directory in file name order.
pub struct DirectorySource {
    dir: PathBuf,
    delete_after_ingest: bool,
    seen: HashSet<PathBuf>,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, delete_after_ingest: bool) -> Self {
        Self {
            dir: dir.into(),
            delete_after_ingest,
            seen: HashSet::new(),
        }
    }

    /// Read a single snapshot file.
    pub async fn read_file(path: &Path) -> PipelineResult<Snapshot> {
        let body = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PipelineError::Fetch(format!("{}: {}", path.display(), e)))?;
        Ok(Snapshot::new(file_id(path), body))
    }

    async fn list(&self) -> PipelineResult<Vec<PathBuf>> {
        let fetch_err = |e: std::io::Error| {
            PipelineError::Fetch(format!("{}: {}", self.dir.display(), e))
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(fetch_err)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(fetch_err)? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl SnapshotSource for DirectorySource {
    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }

    async fn poll(&mut self) -> PipelineResult<Vec<Snapshot>> {
        let files = self.list().await?;
        // Forget files that are gone so the set does not grow forever.
        self.seen.retain(|p| files.contains(p));

        let mut snapshots = Vec::new();
        for path in files {
            if self.seen.contains(&path) {
                continue;
            }
            let snapshot = match tokio::fs::read_to_string(&path).await {
                Ok(body) => {
                    debug!(file = %path.display(), bytes = body.len(), "Read snapshot file");
                    Snapshot::new(file_id(&path), body)
                }
                // Removed between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Unreadable snapshot file");
                    self.seen.insert(path.clone());
                    snapshots.push(Snapshot::unreadable(file_id(&path), e.to_string()));
                    continue;
                }
            };
            self.seen.insert(path.clone());
            snapshots.push(if self.delete_after_ingest {
                snapshot.with_cleanup(path)
            } else {
                snapshot
            });
        }

        if !snapshots.is_empty() {
            info!(dir = %self.dir.display(), files = snapshots.len(), "Found new snapshot files");
        }
        Ok(snapshots)
    }
}

fn file_id(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Fetches the feed over HTTP(S), one snapshot per poll.
pub struct HttpSource {
    url: String,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(url: impl Into<String>) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("parkflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::Fetch(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl SnapshotSource for HttpSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn poll(&mut self) -> PipelineResult<Vec<Snapshot>> {
        let fetched_at = Utc::now();
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PipelineError::Fetch(format!("{}: {}", self.url, e)))?;

        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::Fetch(format!("{}: {}", self.url, e)))?;

        // Every poll is a distinct snapshot, even when the body repeats.
        let id = format!("{}@{}", self.url, fetched_at.to_rfc3339());
        debug!(url = %self.url, bytes = body.len(), "Fetched snapshot");
        Ok(vec![Snapshot::new(id, body)])
    }
}
