// =============================================================================
// Cold Tier — file-indexed historical bars
// =============================================================================
//
// Layout: one directory per venue, partitioned by day:
//
//   <base>/<VENUE>/<YYYY-MM-DD>/<SYMBOL>.csv[.gz]
//   <base>/<VENUE>/<YYYY-MM-DD>/<SYMBOL>.col.json[.gz]
//
// Two file formats share one capability set (load / load-with-time-filter /
// validate / write); the variant is tagged by extension and dispatched
// explicitly. Compression is transparent: a trailing `.gz` wraps either
// format in gzip.
//
// CSV schema (header required, extra columns tolerated and ignored):
//   timestamp, open, high, low, close, volume, venue, tier, provenance
// Timestamps accept RFC3339 or `YYYY-MM-DD HH:MM:SS` (UTC).
//
// The columnar variant stores one JSON array per column, which keeps
// whole-column reads cheap for long ranges.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{Envelope, Ohlc, Payload, Tier};
use crate::error::{ErrorKind, ScanError};

// =============================================================================
// Records and formats
// =============================================================================

/// One persisted bar with its audit columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColdRecord {
    pub bar: Ohlc,
    pub venue: String,
    pub tier: String,
    pub provenance: String,
}

/// Supported on-disk formats, tagged by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Columnar,
}

impl FileFormat {
    /// Detect (format, gzipped) from a file name. Unknown extensions are
    /// not cold files.
    pub fn detect(path: &Path) -> Option<(Self, bool)> {
        let name = path.file_name()?.to_str()?;
        if let Some(stem) = name.strip_suffix(".gz") {
            return Self::detect(Path::new(stem)).map(|(f, _)| (f, true));
        }
        if name.ends_with(".col.json") {
            Some((Self::Columnar, false))
        } else if name.ends_with(".csv") {
            Some((Self::Csv, false))
        } else {
            None
        }
    }

    /// Load every record in the file, sorted by timestamp ascending.
    pub fn load_file(path: &Path) -> Result<Vec<ColdRecord>> {
        let (format, gzipped) =
            Self::detect(path).with_context(|| format!("unknown cold format: {}", path.display()))?;

        let raw = read_maybe_gzip(path, gzipped)?;
        let mut records = match format {
            Self::Csv => parse_csv(&raw)
                .with_context(|| format!("invalid CSV in {}", path.display()))?,
            Self::Columnar => parse_columnar(&raw)
                .with_context(|| format!("invalid columnar file {}", path.display()))?,
        };

        records.sort_by_key(|r| r.bar.timestamp);
        Ok(records)
    }

    /// Load records whose timestamps fall inside `[start, end]`.
    pub fn load_file_with_time_filter(
        path: &Path,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ColdRecord>> {
        let records = Self::load_file(path)?;
        Ok(records
            .into_iter()
            .filter(|r| r.bar.timestamp >= start && r.bar.timestamp <= end)
            .collect())
    }

    /// Cheap validation: the file parses and every bar is finite.
    pub fn validate_file(path: &Path) -> Result<()> {
        let records = Self::load_file(path)?;
        for r in &records {
            let b = &r.bar;
            let finite = b.open.is_finite()
                && b.high.is_finite()
                && b.low.is_finite()
                && b.close.is_finite()
                && b.volume.is_finite();
            if !finite {
                anyhow::bail!(
                    "non-finite bar at {} in {}",
                    b.timestamp,
                    path.display()
                );
            }
        }
        Ok(())
    }

    /// Write records in this format, gzip-compressing when the path ends
    /// in `.gz`. The write is atomic (temp sibling + rename).
    pub fn write_file(path: &Path, records: &[ColdRecord]) -> Result<()> {
        let (format, gzipped) =
            Self::detect(path).with_context(|| format!("unknown cold format: {}", path.display()))?;

        let body = match format {
            Self::Csv => render_csv(records)?,
            Self::Columnar => render_columnar(records)?,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp = path.with_extension("tmp");
        if gzipped {
            let file = std::fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            let mut enc = GzEncoder::new(file, Compression::default());
            enc.write_all(body.as_bytes())
                .context("failed to write gzip body")?;
            enc.finish().context("failed to finish gzip stream")?;
        } else {
            std::fs::write(&tmp, body.as_bytes())
                .with_context(|| format!("failed to write {}", tmp.display()))?;
        }

        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;
        Ok(())
    }
}

fn read_maybe_gzip(path: &Path, gzipped: bool) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if gzipped {
        let mut decoder = GzDecoder::new(&bytes[..]);
        let mut out = String::new();
        decoder
            .read_to_string(&mut out)
            .with_context(|| format!("failed to gunzip {}", path.display()))?;
        Ok(out)
    } else {
        String::from_utf8(bytes).context("cold file is not valid UTF-8")
    }
}

// -----------------------------------------------------------------------------
// CSV codec
// -----------------------------------------------------------------------------

const CSV_COLUMNS: [&str; 9] = [
    "timestamp",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "venue",
    "tier",
    "provenance",
];

/// Parse a timestamp in RFC3339 or `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("unrecognized timestamp '{raw}'"))?;
    Ok(naive.and_utc())
}

fn parse_csv(raw: &str) -> Result<Vec<ColdRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(raw.as_bytes());

    // Map required columns to positions; extra columns are ignored.
    let headers = reader.headers().context("CSV header row missing")?.clone();
    let mut index = [usize::MAX; 9];
    for (pos, name) in headers.iter().enumerate() {
        if let Some(i) = CSV_COLUMNS.iter().position(|c| *c == name.trim()) {
            index[i] = pos;
        }
    }
    for (i, col) in CSV_COLUMNS.iter().enumerate() {
        if index[i] == usize::MAX {
            anyhow::bail!("CSV missing required column '{col}'");
        }
    }

    let field = |record: &csv::StringRecord, i: usize| -> Result<String> {
        record
            .get(index[i])
            .map(|s| s.trim().to_string())
            .with_context(|| format!("row missing column '{}'", CSV_COLUMNS[i]))
    };

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.context("malformed CSV row")?;
        let bar = Ohlc {
            timestamp: parse_timestamp(&field(&row, 0)?)?,
            open: field(&row, 1)?.parse().context("bad open")?,
            high: field(&row, 2)?.parse().context("bad high")?,
            low: field(&row, 3)?.parse().context("bad low")?,
            close: field(&row, 4)?.parse().context("bad close")?,
            volume: field(&row, 5)?.parse().context("bad volume")?,
        };
        records.push(ColdRecord {
            bar,
            venue: field(&row, 6)?,
            tier: field(&row, 7)?,
            provenance: field(&row, 8)?,
        });
    }
    Ok(records)
}

fn render_csv(records: &[ColdRecord]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(CSV_COLUMNS)
        .context("failed to write CSV header")?;

    for r in records {
        writer
            .write_record([
                r.bar.timestamp.to_rfc3339(),
                r.bar.open.to_string(),
                r.bar.high.to_string(),
                r.bar.low.to_string(),
                r.bar.close.to_string(),
                r.bar.volume.to_string(),
                r.venue.clone(),
                r.tier.clone(),
                r.provenance.clone(),
            ])
            .context("failed to write CSV row")?;
    }

    let bytes = writer.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(bytes).context("CSV output is not UTF-8")
}

// -----------------------------------------------------------------------------
// Columnar codec — one JSON array per column
// -----------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct ColumnarFile {
    timestamp: Vec<String>,
    open: Vec<f64>,
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    volume: Vec<f64>,
    venue: Vec<String>,
    tier: Vec<String>,
    provenance: Vec<String>,
}

fn parse_columnar(raw: &str) -> Result<Vec<ColdRecord>> {
    let file: ColumnarFile = serde_json::from_str(raw).context("columnar JSON parse failed")?;

    let n = file.timestamp.len();
    let aligned = file.open.len() == n
        && file.high.len() == n
        && file.low.len() == n
        && file.close.len() == n
        && file.volume.len() == n
        && file.venue.len() == n
        && file.tier.len() == n
        && file.provenance.len() == n;
    if !aligned {
        anyhow::bail!("columnar file has misaligned columns");
    }

    let mut records = Vec::with_capacity(n);
    for i in 0..n {
        records.push(ColdRecord {
            bar: Ohlc {
                timestamp: parse_timestamp(&file.timestamp[i])?,
                open: file.open[i],
                high: file.high[i],
                low: file.low[i],
                close: file.close[i],
                volume: file.volume[i],
            },
            venue: file.venue[i].clone(),
            tier: file.tier[i].clone(),
            provenance: file.provenance[i].clone(),
        });
    }
    Ok(records)
}

fn render_columnar(records: &[ColdRecord]) -> Result<String> {
    let file = ColumnarFile {
        timestamp: records.iter().map(|r| r.bar.timestamp.to_rfc3339()).collect(),
        open: records.iter().map(|r| r.bar.open).collect(),
        high: records.iter().map(|r| r.bar.high).collect(),
        low: records.iter().map(|r| r.bar.low).collect(),
        close: records.iter().map(|r| r.bar.close).collect(),
        volume: records.iter().map(|r| r.bar.volume).collect(),
        venue: records.iter().map(|r| r.venue.clone()).collect(),
        tier: records.iter().map(|r| r.tier.clone()).collect(),
        provenance: records.iter().map(|r| r.provenance.clone()).collect(),
    };
    serde_json::to_string(&file).context("failed to serialize columnar file")
}

// =============================================================================
// ColdTier
// =============================================================================

/// Historical file store for one venue.
pub struct ColdTier {
    base_dir: PathBuf,
    venue: String,
}

impl ColdTier {
    pub fn new(base_dir: impl Into<PathBuf>, venue: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            venue: venue.into(),
        }
    }

    fn venue_dir(&self) -> PathBuf {
        self.base_dir.join(&self.venue)
    }

    fn day_dir(&self, day: NaiveDate) -> PathBuf {
        self.venue_dir().join(day.format("%Y-%m-%d").to_string())
    }

    /// Day directories present on disk, ascending.
    fn days(&self) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        if let Ok(entries) = std::fs::read_dir(self.venue_dir()) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(day) = NaiveDate::parse_from_str(name, "%Y-%m-%d") {
                        days.push(day);
                    }
                }
            }
        }
        days.sort();
        days
    }

    /// Candidate file paths for a symbol within a day directory, preferring
    /// plain CSV, then gzip, then columnar.
    fn symbol_files(&self, day: NaiveDate, symbol: &str) -> Vec<PathBuf> {
        let dir = self.day_dir(day);
        [
            format!("{symbol}.csv"),
            format!("{symbol}.csv.gz"),
            format!("{symbol}.col.json"),
            format!("{symbol}.col.json.gz"),
        ]
        .iter()
        .map(|n| dir.join(n))
        .filter(|p| p.exists())
        .collect()
    }

    /// Whether local files cover any part of `[start, end]` for `symbol`.
    pub fn covers(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.days()
            .into_iter()
            .filter(|d| *d >= start.date_naive() && *d <= end.date_naive())
            .any(|d| !self.symbol_files(d, symbol).is_empty())
    }

    /// Whether any file at all exists for `symbol`.
    pub fn is_available(&self, symbol: &str) -> bool {
        self.days()
            .into_iter()
            .any(|d| !self.symbol_files(d, symbol).is_empty())
    }

    /// Range read across day partitions, ascending.
    pub fn get_historical(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Envelope, ScanError> {
        let mut bars: Vec<Ohlc> = Vec::new();

        for day in self
            .days()
            .into_iter()
            .filter(|d| *d >= start.date_naive() && *d <= end.date_naive())
        {
            for path in self.symbol_files(day, symbol) {
                let records = FileFormat::load_file_with_time_filter(&path, start, end)
                    .map_err(|e| {
                        ScanError::new(
                            ErrorKind::DataQuality,
                            format!("cold file {} failed to load: {e}", path.display()),
                        )
                        .with_offender(symbol.to_string())
                    })?;
                bars.extend(records.into_iter().map(|r| r.bar));
            }
        }

        if bars.is_empty() {
            return Err(ScanError::new(
                ErrorKind::Transient,
                format!("no cold coverage for {symbol} in requested range"),
            )
            .with_offender(symbol.to_string()));
        }

        bars.sort_by_key(|b| b.timestamp);
        let timestamp = bars.last().map(|b| b.timestamp).unwrap_or(end);

        debug!(symbol, bars = bars.len(), "cold range read");
        Ok(self.envelope(symbol, timestamp, Payload::Historical(bars)))
    }

    /// Single-point read: most recent bar across partitions, newest day
    /// first.
    pub fn latest_price(&self, symbol: &str) -> Result<Envelope, ScanError> {
        for day in self.days().into_iter().rev() {
            for path in self.symbol_files(day, symbol) {
                let records = FileFormat::load_file(&path).map_err(|e| {
                    ScanError::new(
                        ErrorKind::DataQuality,
                        format!("cold file {} failed to load: {e}", path.display()),
                    )
                    .with_offender(symbol.to_string())
                })?;

                if let Some(last) = records.last() {
                    let volume_24h_usd: f64 = records
                        .iter()
                        .rev()
                        .take(24)
                        .map(|r| r.bar.volume * r.bar.close)
                        .sum();
                    return Ok(self.envelope(
                        symbol,
                        last.bar.timestamp,
                        Payload::Price {
                            bar: last.bar.clone(),
                            volume_24h_usd,
                        },
                    ));
                }
            }
        }

        Err(ScanError::new(
            ErrorKind::Transient,
            format!("no cold files for {symbol}"),
        )
        .with_offender(symbol.to_string()))
    }

    /// Persist a day partition (used by backfill jobs and tests). Format
    /// and compression follow the file name passed in.
    pub fn write_day(&self, day: NaiveDate, file_name: &str, records: &[ColdRecord]) -> Result<()> {
        let path = self.day_dir(day).join(file_name);
        FileFormat::write_file(&path, records)
    }

    fn envelope(&self, symbol: &str, timestamp: DateTime<Utc>, payload: Payload) -> Envelope {
        Envelope::new(
            symbol,
            &self.venue,
            timestamp,
            Tier::Cold,
            payload,
            "cold_files",
            false,
        )
    }
}

impl std::fmt::Debug for ColdTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColdTier")
            .field("base_dir", &self.base_dir)
            .field("venue", &self.venue)
            .finish()
    }
}
