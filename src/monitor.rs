//! Watches a domain's resolved address and logs every change to a CSV store.
//!
//! Independent of the port scanner; the two only share the resolver and the
//! sink's append helper.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ::time::OffsetDateTime;
use tokio::task;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock;
use crate::error::{Result, ScanError};
use crate::resolver::Resolver;
use crate::sink::{append_rows, format_date, format_time};

/// Header of the address-change store.
pub const MONITOR_HEADER: [&str; 5] = ["id", "nombre del dominio", "ip", "fecha", "hora"];

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MonitorRecord {
    pub id: u64,
    #[serde(rename = "nombre del dominio")]
    pub domain: String,
    pub ip: IpAddr,
    #[serde(rename = "fecha")]
    pub date: String,
    #[serde(rename = "hora")]
    pub time: String,
}

impl MonitorRecord {
    fn new(id: u64, domain: &str, ip: IpAddr, at: OffsetDateTime) -> Self {
        Self {
            id,
            domain: domain.to_string(),
            ip,
            date: format_date(at),
            time: format_time(at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRequest {
    pub domain: String,
    pub interval: Duration,
    /// Stop after this many polls following the initial resolution.
    pub max_polls: Option<u64>,
}

impl MonitorRequest {
    pub fn new(domain: impl Into<String>, interval: Duration) -> Result<Self> {
        let domain = domain.into().trim().to_string();
        if domain.is_empty() {
            return Err(ScanError::InvalidRequest("domain must not be empty".into()));
        }
        if interval.is_zero() {
            return Err(ScanError::InvalidRequest("poll interval must be positive".into()));
        }
        Ok(Self {
            domain,
            interval,
            max_polls: None,
        })
    }

    pub fn with_max_polls(mut self, polls: u64) -> Self {
        self.max_polls = Some(polls);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSummary {
    pub domain: String,
    pub store: PathBuf,
    pub polls: u64,
    pub failed_polls: u64,
    /// Records appended, including the initial one.
    pub changes_recorded: u64,
    pub last_ip: IpAddr,
}

/// Run the monitor until `cancel` fires or `max_polls` is reached.
///
/// The initial resolution is fatal on failure and is always persisted as
/// record 1. Later resolution failures are logged and skipped; persistence
/// failures end the run.
pub async fn monitor<R: Resolver>(
    resolver: &R,
    request: &MonitorRequest,
    store: impl AsRef<Path>,
    cancel: CancellationToken,
) -> Result<MonitorSummary> {
    let store = store.as_ref();
    let domain = request.domain.as_str();

    let mut current = resolver.resolve(domain).await?;
    let mut record_id = 1u64;
    info!(domain, ip = %current, "initial address");
    persist(store, MonitorRecord::new(record_id, domain, current, clock::now())).await?;

    let mut summary = MonitorSummary {
        domain: domain.to_string(),
        store: store.to_path_buf(),
        polls: 0,
        failed_polls: 0,
        changes_recorded: 1,
        last_ip: current,
    };

    while request.max_polls.map_or(true, |max| summary.polls < max) {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(domain, "monitor stopped");
                break;
            }
            _ = time::sleep(request.interval) => {}
        }
        summary.polls += 1;

        let ip = match resolver.resolve(domain).await {
            Ok(ip) => ip,
            Err(e) => {
                summary.failed_polls += 1;
                warn!(domain, error = %e, "poll failed; keeping previous address");
                continue;
            }
        };
        if ip == current {
            info!(domain, %ip, "address unchanged");
            continue;
        }

        info!(domain, from = %current, to = %ip, "address changed");
        current = ip;
        record_id += 1;
        persist(store, MonitorRecord::new(record_id, domain, current, clock::now())).await?;
        summary.changes_recorded += 1;
        summary.last_ip = current;
    }

    Ok(summary)
}

/// Append one record off the async runtime.
async fn persist(store: &Path, record: MonitorRecord) -> Result<usize> {
    let path = store.to_path_buf();
    task::spawn_blocking(move || append_rows(&path, &MONITOR_HEADER, &[record]))
        .await
        .map_err(|e| ScanError::persistence(store, std::io::Error::other(e.to_string())))?
}
