//! Append/merge persistence, one artifact per (model, persona).
//!
//! Records are only ever appended. Every flush re-reads the artifact, appends the buffered
//! records, recomputes the statistics header and atomically replaces the file. Records stay
//! raw JSON on disk so a rewrite never drops fields this version does not model.

pub mod codec;
pub mod io;
pub mod layout;

use crate::errors::StoreError;
use crate::model::ResultRecord;
use crate::stats::{self, ScoringMode, Statistics};
use codec::{Decoded, OutputFormat};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A file larger than this that yields zero records is treated as a read fault.
const MIN_SUSPICIOUS_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreOptions {
    pub format: OutputFormat,
    pub batch_size: usize,
    pub scoring: ScoringMode,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Json,
            batch_size: 10,
            scoring: ScoringMode::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Buffer {
    pending: Vec<Value>,
    /// Records in the artifact as of the last successful load or flush.
    committed: usize,
    statistics: Statistics,
}

/// Typed view of an artifact, for reporting.
#[derive(Debug, Clone, Default)]
pub struct Artifact {
    pub statistics: Option<Statistics>,
    pub records: Vec<ResultRecord>,
    /// Raw entries that did not parse as a [`ResultRecord`].
    pub skipped: usize,
}

pub struct ArtifactStore {
    path: PathBuf,
    temp: PathBuf,
    options: StoreOptions,
    authoritative: HashSet<String>,
    buffer: Mutex<Buffer>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ArtifactStore {
    /// Loads the artifact at `path` if present and indexes its authoritative ids.
    pub async fn open(path: impl Into<PathBuf>, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.into();
        let decoded = read_decoded(&path, options.format).await?;
        let artifact = typed(&decoded.records);
        let authoritative: HashSet<String> = stats::authoritative(&artifact.records)
            .into_iter()
            .map(|r| r.question_id.clone())
            .collect();

        debug!(
            path = %path.display(),
            records = decoded.records.len(),
            authoritative = authoritative.len(),
            "opened artifact"
        );

        Ok(Self {
            temp: io::unique_tmp_path(&path),
            path,
            options,
            authoritative,
            buffer: Mutex::new(Buffer {
                pending: Vec::new(),
                committed: decoded.records.len(),
                statistics: stats::compute(&artifact.records, options.scoring),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Question ids that already have a non-empty record at open time.
    pub fn authoritative_ids(&self) -> &HashSet<String> {
        &self.authoritative
    }

    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.pending.len()
    }

    /// Statistics as of the last successful flush, or as opened.
    pub async fn statistics(&self) -> Statistics {
        self.buffer.lock().await.statistics.clone()
    }

    /// Buffers a record; flushes once the batch is full.
    pub async fn append(&self, record: &ResultRecord) -> Result<(), StoreError> {
        let value = serde_json::to_value(record)?;
        let mut buffer = self.buffer.lock().await;
        buffer.pending.push(value);
        if buffer.pending.len() >= self.options.batch_size.max(1) {
            self.flush_locked(&mut buffer, false).await?;
        }
        Ok(())
    }

    /// Writes any buffered records. Returns how many were written.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer, false).await
    }

    /// Flushes and rewrites the statistics header even when nothing is buffered.
    pub async fn finalize(&self) -> Result<Statistics, StoreError> {
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer, true).await?;
        Ok(buffer.statistics.clone())
    }

    async fn flush_locked(&self, buffer: &mut Buffer, force: bool) -> Result<usize, StoreError> {
        if buffer.pending.is_empty() && !force {
            return Ok(0);
        }

        let text = io::read_if_exists(&self.path).await?;
        let on_disk = match &text {
            Some(t) => codec::decode(self.options.format, &self.path, t)?.records,
            None => Vec::new(),
        };
        let replacement = on_disk.len() + buffer.pending.len();

        if on_disk.len() < buffer.committed {
            return Err(StoreError::ShrinkGuard {
                path: self.path.clone(),
                replacement,
                on_disk: buffer.committed,
            });
        }
        if let Some(t) = &text {
            if on_disk.is_empty() && t.len() > MIN_SUSPICIOUS_BYTES {
                return Err(StoreError::Corrupt {
                    path: self.path.clone(),
                    reason: format!("{} bytes on disk but no records could be read", t.len()),
                });
            }
        }

        let mut merged = on_disk;
        merged.extend(buffer.pending.iter().cloned());
        let statistics = stats::compute(&typed(&merged).records, self.options.scoring);
        let content = codec::encode(self.options.format, &statistics, &merged)?;

        if let Err(e) = io::write_atomic(&self.path, &self.temp, &content).await {
            warn!(
                path = %self.path.display(),
                buffered = buffer.pending.len(),
                error = %e,
                "flush failed; keeping buffered records"
            );
            return Err(e);
        }

        let written = buffer.pending.len();
        buffer.pending.clear();
        buffer.committed = merged.len();
        buffer.statistics = statistics;
        info!(
            path = %self.path.display(),
            written,
            total = merged.len(),
            accuracy = buffer.statistics.total.accuracy,
            "artifact flushed"
        );
        Ok(written)
    }
}

async fn read_decoded(path: &Path, format: OutputFormat) -> Result<Decoded, StoreError> {
    match io::read_if_exists(path).await? {
        Some(text) => codec::decode(format, path, &text),
        None => Ok(Decoded::default()),
    }
}

fn typed(records: &[Value]) -> Artifact {
    let mut artifact = Artifact::default();
    for value in records {
        match serde_json::from_value::<ResultRecord>(value.clone()) {
            Ok(record) => artifact.records.push(record),
            Err(e) => {
                debug!(error = %e, "record does not match the result shape; not scored");
                artifact.skipped += 1;
            }
        }
    }
    artifact
}

/// Reads an artifact in either encoding, chosen by extension.
pub async fn load_artifact(path: &Path) -> Result<Artifact, StoreError> {
    let decoded = read_decoded(path, OutputFormat::from_path(path)).await?;
    let mut artifact = typed(&decoded.records);
    artifact.statistics = decoded.statistics;
    Ok(artifact)
}

/// Recomputes and rewrites the statistics header of an existing artifact.
pub async fn rewrite_header(path: &Path, scoring: ScoringMode) -> Result<Statistics, StoreError> {
    let options = StoreOptions {
        format: OutputFormat::from_path(path),
        batch_size: 1,
        scoring,
    };
    ArtifactStore::open(path, options).await?.finalize().await
}
