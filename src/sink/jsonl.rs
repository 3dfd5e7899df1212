//! JSON Lines dataset sink.
//!
//! Each record goes to the file as one complete line in a single write and
//! is flushed before `write` returns, so an interrupted run leaves only whole
//! records behind.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::error::SinkError;
use crate::generator::source_fingerprint;
use crate::sink::{DatasetRecord, DatasetSink};

/// Writes one JSON object per line.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Option<File>,
    written: usize,
}

impl JsonlSink {
    /// Creates (or truncates) the output file.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        ensure_parent(&path).await?;
        let file = File::create(&path).await?;
        Ok(Self::with_file(path, file))
    }

    /// Opens the output file for appending, creating it if needed.
    pub async fn append(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        ensure_parent(&path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self::with_file(path, file))
    }

    fn with_file(path: PathBuf, file: File) -> Self {
        debug!(path = %path.display(), "Opened JSONL sink");
        Self {
            path,
            file: Some(file),
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written through this sink.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flushes and closes the file. Later writes fail with
    /// [`SinkError::Closed`].
    pub async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

async fn ensure_parent(path: &Path) -> Result<(), SinkError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl DatasetSink for JsonlSink {
    async fn write(&mut self, record: &DatasetRecord) -> Result<(), SinkError> {
        let file = self.file.as_mut().ok_or(SinkError::Closed)?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await?;
        self.written += 1;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        match self.file.as_mut() {
            Some(file) => {
                file.flush().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Reads the fingerprints of samples already in a JSONL dataset.
///
/// Uses each record's `fingerprint` field, or fingerprints its `output` when
/// the field is missing. Unreadable lines are skipped with a warning. A
/// missing file yields an empty set.
pub async fn existing_fingerprints(path: impl AsRef<Path>) -> Result<HashSet<String>, SinkError> {
    let path = path.as_ref();
    let mut fingerprints = HashSet::new();
    if !path.exists() {
        return Ok(fingerprints);
    }

    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut lineno = 0usize;
    while let Some(line) = lines.next_line().await? {
        lineno += 1;
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), line = lineno, error = %e, "Skipping unreadable record");
                continue;
            }
        };
        if let Some(fp) = value.get("fingerprint").and_then(|v| v.as_str()) {
            fingerprints.insert(fp.to_string());
        } else if let Some(output) = value.get("output").and_then(|v| v.as_str()) {
            fingerprints.insert(source_fingerprint(output));
        }
    }

    debug!(path = %path.display(), count = fingerprints.len(), "Loaded existing fingerprints");
    Ok(fingerprints)
}
