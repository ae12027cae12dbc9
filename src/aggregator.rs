use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::warn;

use crate::clock;
use crate::types::{PortState, ScanOutcome, ScanReport, Termination};

/// Live counters readable while a scan is running. A `Scanner` resets them
/// when each scan starts, so they describe the most recent scan.
#[derive(Clone, Debug, Default)]
pub struct SharedProgress {
    pub scanned_done: Arc<AtomicU64>,
    pub open_count: Arc<AtomicU64>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.scanned_done.store(0, Ordering::Relaxed);
        self.open_count.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.scanned_done.load(Ordering::Relaxed),
            self.open_count.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Default)]
struct Collected {
    open: Vec<ScanOutcome>,
    seen: HashSet<u16>,
    closed: u64,
    errored: u64,
    finalized: Option<ScanReport>,
}

/// The single point of mutation for a running scan's results.
///
/// `record` calls are serialized through a mutex. Once `finalize` has run the
/// report is frozen and later records are rejected.
#[derive(Debug)]
pub struct Aggregator {
    host: String,
    addr: IpAddr,
    scanned_total: u64,
    started_at: OffsetDateTime,
    progress: SharedProgress,
    inner: Mutex<Collected>,
}

impl Aggregator {
    pub fn new(host: impl Into<String>, addr: IpAddr, scanned_total: u64) -> Self {
        Self::with_progress(host, addr, scanned_total, SharedProgress::new())
    }

    pub fn with_progress(
        host: impl Into<String>,
        addr: IpAddr,
        scanned_total: u64,
        progress: SharedProgress,
    ) -> Self {
        Self {
            host: host.into(),
            addr,
            scanned_total,
            started_at: clock::now(),
            progress,
            inner: Mutex::new(Collected::default()),
        }
    }

    pub fn progress(&self) -> &SharedProgress {
        &self.progress
    }

    /// Record one outcome. Returns `false` when the outcome was rejected,
    /// either because its port was already recorded or the report is final.
    pub async fn record(&self, outcome: ScanOutcome) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.finalized.is_some() {
            warn!(port = outcome.port(), "outcome arrived after finalize; dropped");
            return false;
        }
        if !guard.seen.insert(outcome.port()) {
            warn!(port = outcome.port(), "duplicate outcome; dropped");
            return false;
        }
        match outcome.state {
            PortState::Open => {
                self.progress.open_count.fetch_add(1, Ordering::Relaxed);
                guard.open.push(outcome);
            }
            PortState::Closed => guard.closed += 1,
            PortState::Errored => guard.errored += 1,
        }
        self.progress.scanned_done.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Outcomes accepted by this aggregator so far.
    pub async fn recorded(&self) -> u64 {
        self.inner.lock().await.seen.len() as u64
    }

    /// Freeze and return the report. The first call decides `termination`;
    /// subsequent calls return the same report.
    pub async fn finalize(&self, termination: Termination) -> ScanReport {
        let mut guard = self.inner.lock().await;
        if let Some(report) = &guard.finalized {
            return report.clone();
        }
        let mut open = std::mem::take(&mut guard.open);
        open.sort_by_key(ScanOutcome::port);
        let report = ScanReport {
            host: self.host.clone(),
            addr: self.addr,
            scanned_done: guard.seen.len() as u64,
            scanned_total: self.scanned_total,
            closed_count: guard.closed,
            errored_count: guard.errored,
            open,
            termination,
            started_at: self.started_at,
            finished_at: clock::now(),
        };
        guard.finalized = Some(report.clone());
        report
    }
}
