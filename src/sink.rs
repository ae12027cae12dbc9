//! Append-only CSV record stores.
//!
//! A store gets its header exactly once, when the file is new or empty. Every
//! append opens the file, writes, flushes, syncs and closes it again, so no
//! handle outlives a single call.

use std::fs::OpenOptions;
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::{Result, ScanError};
use crate::types::{ScanOutcome, ScanReport};

/// Header of the open-port store.
pub const SCAN_HEADER: [&str; 4] = ["ip", "puerto abierto", "fecha", "hora"];

/// Durable projection of one open port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    #[serde(rename = "ip")]
    pub host: String,
    #[serde(rename = "puerto abierto")]
    pub port: u16,
    #[serde(rename = "fecha")]
    pub date: String,
    #[serde(rename = "hora")]
    pub time: String,
}

impl PersistedRecord {
    /// Date and time come from when the port was observed, not when the
    /// scan started.
    pub fn from_outcome(outcome: &ScanOutcome) -> Self {
        Self {
            host: outcome.target.host().to_string(),
            port: outcome.port(),
            date: format_date(outcome.observed_at),
            time: format_time(outcome.observed_at),
        }
    }
}

/// `YYYY-MM-DD`
pub fn format_date(ts: OffsetDateTime) -> String {
    ts.format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| String::from("1970-01-01"))
}

/// `HH:MM:SS`, 24-hour clock.
pub fn format_time(ts: OffsetDateTime) -> String {
    ts.format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_else(|_| String::from("00:00:00"))
}

/// Append the report's open ports to the store at `path`.
///
/// Returns the number of data rows written. On failure the report is left
/// untouched and the append can be retried, possibly against another path.
pub fn append(report: &ScanReport, path: impl AsRef<Path>) -> Result<usize> {
    let rows: Vec<PersistedRecord> = report.open.iter().map(PersistedRecord::from_outcome).collect();
    let written = append_rows(path.as_ref(), &SCAN_HEADER, &rows)?;
    info!(
        path = %path.as_ref().display(),
        rows = written,
        host = %report.host,
        "open ports persisted"
    );
    Ok(written)
}

/// Append `rows` to a CSV store, writing `header` first only if the store is
/// new or empty.
pub fn append_rows<T: Serialize>(path: &Path, header: &[&str], rows: &[T]) -> Result<usize> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ScanError::persistence(path, e))?;
    let needs_header = file
        .metadata()
        .map_err(|e| ScanError::persistence(path, e))?
        .len()
        == 0;

    {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(&mut file);
        if needs_header {
            debug!(path = %path.display(), "new record store; writing header");
            wtr.write_record(header)
                .map_err(|e| ScanError::persistence(path, e))?;
        }
        for row in rows {
            wtr.serialize(row)
                .map_err(|e| ScanError::persistence(path, e))?;
        }
        wtr.flush().map_err(|e| ScanError::persistence(path, e))?;
    }
    file.sync_data()
        .map_err(|e| ScanError::persistence(path, e))?;
    Ok(rows.len())
}
