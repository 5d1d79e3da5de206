use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parkflow_core::{Batch, Record};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::SinkResult;
use crate::{Sink, SinkKind};

#[derive(Serialize)]
struct JsonlRow<'a> {
    batch_seq: u64,
    #[serde(flatten)]
    record: &'a Record,
}

/// Durable sink appending one JSON object per row to a file.
///
/// Replaying a batch after a crash appends its rows again; consumers that
/// need exactly-once can dedupe on `batch_seq`. A partial last line left by
/// an interrupted append is cut off before the next batch is written.
pub struct JsonlSink {
    name: String,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Sink for JsonlSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Durable
    }

    async fn commit(&self, batch: &Batch) -> SinkResult<()> {
        let mut buf = Vec::new();
        for record in &batch.rows {
            serde_json::to_writer(
                &mut buf,
                &JsonlRow {
                    batch_seq: batch.seq,
                    record,
                },
            )?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;
        let start = trim_torn_tail(&mut file).await?;

        file.seek(SeekFrom::Start(start)).await?;
        let written = async {
            file.write_all(&buf).await?;
            file.sync_data().await
        }
        .await;
        if let Err(e) = written {
            if let Err(trunc) = file.set_len(start).await {
                warn!(path = %self.path.display(), error = %trunc, "Failed to roll back partial append");
            }
            return Err(e.into());
        }

        debug!(path = %self.path.display(), seq = batch.seq, rows = batch.len(), "Appended batch");
        Ok(())
    }
}

/// Drop everything after the last newline and return the new length.
async fn trim_torn_tail(file: &mut File) -> std::io::Result<u64> {
    const CHUNK: u64 = 4096;

    let len = file.metadata().await?.len();
    let mut buf = vec![0u8; CHUNK as usize];
    let mut end = len;
    while end > 0 {
        let begin = end.saturating_sub(CHUNK);
        let n = (end - begin) as usize;
        file.seek(SeekFrom::Start(begin)).await?;
        file.read_exact(&mut buf[..n]).await?;
        if let Some(pos) = buf[..n].iter().rposition(|b| *b == b'\n') {
            end = begin + pos as u64 + 1;
            break;
        }
        end = begin;
    }

    if end < len {
        warn!(dropped_bytes = len - end, "Trimming partial line from JSON-lines file");
        file.set_len(end).await?;
    }
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_appends_rows_with_batch_seq() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out/changes.jsonl");
        let sink = JsonlSink::new("archive", &path);

        sink.commit(&Batch::new(1, vec![Record::new("P1", 10, false)]))
            .await
            .unwrap();
        sink.commit(&Batch::new(
            2,
            vec![Record::new("P1", 7, false), Record::new("P2", 3, true)],
        ))
        .await
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["batch_seq"], 1);
        assert_eq!(lines[0]["facility_key"], "P1");
        assert_eq!(lines[2]["batch_seq"], 2);
        assert_eq!(lines[2]["closed"], true);
        assert!(lines[2]["observed_at"].is_null());
    }

    #[tokio::test]
    async fn test_partial_last_line_is_trimmed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("changes.jsonl");
        std::fs::write(
            &path,
            "{\"batch_seq\":1,\"facility_key\":\"P1\"}\n{\"batch_seq\":2,\"fac",
        )
        .unwrap();

        let sink = JsonlSink::new("archive", &path);
        sink.commit(&Batch::new(2, vec![Record::new("P1", 4, false)]))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["batch_seq"], 2);
        assert_eq!(lines[1]["available_spaces"], 4);
    }

    #[tokio::test]
    async fn test_file_without_newline_is_emptied() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("changes.jsonl");
        std::fs::write(&path, "{\"batch_se").unwrap();

        let sink = JsonlSink::new("archive", &path);
        sink.commit(&Batch::new(1, vec![Record::new("P1", 4, false)]))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.starts_with("{\"batch_seq\":1"));
    }

    #[tokio::test]
    async fn test_io_failure_is_retryable() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be opened for appending.
        let sink = JsonlSink::new("archive", dir.path());

        let err = sink
            .commit(&Batch::new(1, vec![Record::new("P1", 1, false)]))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
