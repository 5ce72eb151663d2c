//! Archival record persistence
// (c) 2025 Ross Younger

use std::fs;
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Consumes finished measurement records.
///
/// Implementations persist one JSON record under a location derived from
/// `(datatype, subkind, now, id)`. Writes are idempotent per id: the id is
/// embedded in the target path, so re-archiving the same record is at worst a
/// no-op failure.
pub trait ResultSink: Send + Sync {
    /// Persists one record, returning where it ended up.
    fn write(
        &self,
        datatype: &str,
        subkind: &str,
        id: &str,
        record: &serde_json::Value,
    ) -> anyhow::Result<PathBuf>;
}

/// Derives the archive location for a record:
/// `<root>/<datatype>/<YYYY>/<MM>/<DD>/<datatype>-<subkind>-<timestamp>.<id>.json`.
///
/// A pure function of its inputs, so concurrent writers derive disjoint paths
/// as long as their (id, timestamp) pairs differ.
pub fn data_file_path(
    root: &Path,
    datatype: &str,
    subkind: &str,
    id: &str,
    now: DateTime<Utc>,
) -> PathBuf {
    let mut path = root.join(datatype);
    path.push(now.format("%Y/%m/%d").to_string());
    path.push(format!(
        "{datatype}-{subkind}-{}.{id}.json",
        now.format("%Y%m%dT%H%M%S%.9fZ")
    ));
    path
}

/// The standard [`ResultSink`]: plain JSON files under a data directory.
#[derive(Debug, Clone)]
pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    /// A sink rooted at the given data directory.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl ResultSink for FileSink {
    fn write(
        &self,
        datatype: &str,
        subkind: &str,
        id: &str,
        record: &serde_json::Value,
    ) -> anyhow::Result<PathBuf> {
        let path = data_file_path(&self.root, datatype, subkind, id, Utc::now());
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create archive directory {}", dir.display()))?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("failed to create archive file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, record).context("failed to encode archive record")?;
        writer.flush().context("failed to flush archive record")?;
        debug!("archived {datatype}/{subkind} record for {id} to {}", path.display());
        Ok(path)
    }
}
