// =============================================================================
// PIT Snapshot Store — append-only, compressed, time-indexed
// =============================================================================
//
// Layout: <base>/<entity>/<YYYY-MM-DD>/<YYYYMMDD_HHMMSS.ffffff>.json.gz
//
// Writes are create-exclusive: a second write with the exact same
// microsecond timestamp is a no-op, never an overwrite, so the store is
// append-only by construction and two concurrent writers resolve without a
// lock. Range listing walks date directories in order and yields snapshots
// lazily so large entities replay as a stream rather than a materialized
// vector.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const FILE_SUFFIX: &str = ".json.gz";
const TS_FORMAT: &str = "%Y%m%d_%H%M%S%.6f";

/// One immutable snapshot record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PitSnapshot {
    pub entity: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only snapshot store rooted at one directory. The store
/// exclusively owns its on-disk layout.
pub struct PitStore {
    base: PathBuf,
}

impl PitStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn entity_dir(&self, entity: &str) -> PathBuf {
        self.base.join(entity)
    }

    fn snapshot_path(&self, entity: &str, timestamp: DateTime<Utc>) -> PathBuf {
        self.entity_dir(entity)
            .join(timestamp.format("%Y-%m-%d").to_string())
            .join(format!("{}{FILE_SUFFIX}", timestamp.format(TS_FORMAT)))
    }

    /// Derive a source label from the payload: a "venue" field on map
    /// payloads, else "unknown".
    fn derive_source(payload: &serde_json::Value) -> String {
        payload
            .get("venue")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string()
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Persist a snapshot. Returns `true` when a new file was written,
    /// `false` when an identical-timestamp snapshot already existed (the
    /// first write's bytes are left untouched).
    pub fn snapshot(
        &self,
        entity: &str,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
        source: Option<&str>,
    ) -> Result<bool> {
        let path = self.snapshot_path(entity, timestamp);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let record = PitSnapshot {
            entity: entity.to_string(),
            timestamp,
            source: source
                .map(str::to_string)
                .unwrap_or_else(|| Self::derive_source(&payload)),
            payload,
            created_at: Utc::now(),
        };

        // create_new: the filesystem arbitrates duplicate timestamps.
        let file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(entity, path = %path.display(), "duplicate snapshot timestamp — no-op");
                return Ok(false);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to create {}", path.display()))
            }
        };

        let body = serde_json::to_vec(&record).context("failed to serialize snapshot")?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder
            .write_all(&body)
            .context("failed to write snapshot body")?;
        encoder.finish().context("failed to finish snapshot gzip")?;

        debug!(entity, ts = %timestamp, "snapshot written");
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Read the snapshot at an exact timestamp.
    pub fn read(&self, entity: &str, timestamp: DateTime<Utc>) -> Result<PitSnapshot> {
        let path = self.snapshot_path(entity, timestamp);
        read_snapshot_file(&path)
    }

    /// Lazily iterate snapshots for `entity` inside `[from, to]`, sorted
    /// ascending by the filename timestamp.
    pub fn list(
        &self,
        entity: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SnapshotIter {
        let mut days: Vec<PathBuf> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(self.entity_dir(entity)) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Ok(day) = NaiveDate::parse_from_str(name, "%Y-%m-%d") {
                    if day >= from.date_naive() && day <= to.date_naive() {
                        days.push(entry.path());
                    }
                }
            }
        }
        days.sort();

        SnapshotIter {
            days,
            day_index: 0,
            pending: Vec::new(),
            from,
            to,
        }
    }

    /// Entities present in the store.
    pub fn list_entities(&self) -> Vec<String> {
        let mut entities = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.base) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        entities.push(name.to_string());
                    }
                }
            }
        }
        entities.sort();
        entities
    }

    /// Delete whole date partitions older than `retention_days`.
    pub fn cleanup(&self, retention_days: i64) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();
        let mut removed = 0usize;

        for entity in self.list_entities() {
            let dir = self.entity_dir(&entity);
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Ok(day) = NaiveDate::parse_from_str(name, "%Y-%m-%d") {
                    if day < cutoff {
                        std::fs::remove_dir_all(entry.path()).with_context(|| {
                            format!("failed to remove {}", entry.path().display())
                        })?;
                        removed += 1;
                    }
                }
            }
        }

        info!(removed, retention_days, "PIT cleanup complete");
        Ok(removed)
    }
}

impl std::fmt::Debug for PitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PitStore").field("base", &self.base).finish()
    }
}

fn read_snapshot_file(path: &Path) -> Result<PitSnapshot> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut decoder = GzDecoder::new(&bytes[..]);
    let mut body = Vec::new();
    decoder
        .read_to_end(&mut body)
        .with_context(|| format!("failed to gunzip {}", path.display()))?;
    serde_json::from_slice(&body)
        .with_context(|| format!("failed to parse snapshot {}", path.display()))
}

/// Timestamp encoded in a snapshot file name, if the name parses.
fn filename_timestamp(path: &Path) -> Option<NaiveDateTime> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(FILE_SUFFIX)?;
    NaiveDateTime::parse_from_str(stem, TS_FORMAT).ok()
}

/// Lazy, restartable range iterator. Files are read one at a time; only
/// file NAMES for the current day are held in memory.
pub struct SnapshotIter {
    days: Vec<PathBuf>,
    day_index: usize,
    /// Remaining file paths for the current day, ascending (popped front
    /// via reverse-sorted Vec).
    pending: Vec<PathBuf>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

impl Iterator for SnapshotIter {
    type Item = Result<PitSnapshot>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(path) = self.pending.pop() {
                return Some(read_snapshot_file(&path));
            }

            if self.day_index >= self.days.len() {
                return None;
            }

            let day_dir = &self.days[self.day_index];
            self.day_index += 1;

            let Ok(entries) = std::fs::read_dir(day_dir) else { continue };
            let mut files: Vec<(NaiveDateTime, PathBuf)> = entries
                .flatten()
                .filter_map(|e| {
                    let path = e.path();
                    let ts = filename_timestamp(&path)?;
                    let utc = ts.and_utc();
                    (utc >= self.from && utc <= self.to).then_some((ts, path))
                })
                .collect();

            // Reverse order so Vec::pop yields ascending timestamps.
            files.sort_by(|a, b| b.0.cmp(&a.0));
            self.pending = files.into_iter().map(|(_, p)| p).collect();
        }
    }
}
