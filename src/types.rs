use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::{Result, ScanError};
use crate::ports::PortRange;

/// Upper bound on simultaneous connect attempts; larger requests are clamped.
pub const MAX_CONCURRENCY: usize = 5_000;

/// One (host, port) pair to probe.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        if port == 0 {
            return Err(ScanError::InvalidRequest("port 0 is not a valid target".into()));
        }
        Ok(Self {
            host: host.into(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    /// The handshake completed.
    Open,
    /// The remote actively refused the connection.
    Closed,
    /// Anything else: timeout, unreachable, resource exhaustion.
    Errored,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Open => write!(f, "open"),
            PortState::Closed => write!(f, "closed"),
            PortState::Errored => write!(f, "errored"),
        }
    }
}

/// Result of exactly one connect attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub target: Target,
    pub state: PortState,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    pub elapsed_ms: u64,
}

impl ScanOutcome {
    pub fn port(&self) -> u16 {
        self.target.port()
    }

    pub fn is_open(&self) -> bool {
        self.state == PortState::Open
    }
}

/// A validated scan request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    host: String,
    ports: PortRange,
    max_concurrency: usize,
    per_attempt_timeout: Duration,
    budget: Option<Duration>,
}

impl ScanRequest {
    pub fn new(
        host: impl Into<String>,
        ports: PortRange,
        max_concurrency: usize,
        per_attempt_timeout: Duration,
    ) -> Result<Self> {
        let host = host.into().trim().to_string();
        if host.is_empty() {
            return Err(ScanError::InvalidRequest("host must not be empty".into()));
        }
        if max_concurrency == 0 {
            return Err(ScanError::InvalidRequest(
                "max concurrency must be at least 1".into(),
            ));
        }
        if per_attempt_timeout.is_zero() {
            return Err(ScanError::InvalidRequest(
                "per-attempt timeout must be positive".into(),
            ));
        }
        let max_concurrency = if max_concurrency > MAX_CONCURRENCY {
            tracing::warn!(
                requested = max_concurrency,
                limit = MAX_CONCURRENCY,
                "clamping concurrency"
            );
            MAX_CONCURRENCY
        } else {
            max_concurrency
        };
        Ok(Self {
            host,
            ports,
            max_concurrency,
            per_attempt_timeout,
            budget: None,
        })
    }

    /// Convenience constructor from raw port numbers.
    pub fn from_bounds(
        host: impl Into<String>,
        start: u16,
        end: u16,
        max_concurrency: usize,
        per_attempt_timeout: Duration,
    ) -> Result<Self> {
        let ports = PortRange::new(start, end)
            .map_err(|e| ScanError::InvalidRequest(e.to_string()))?;
        Self::new(host, ports, max_concurrency, per_attempt_timeout)
    }

    /// Cap the whole scan's wall-clock time. Targets still pending when it
    /// runs out are abandoned.
    pub fn with_budget(mut self, budget: Duration) -> Result<Self> {
        if budget.is_zero() {
            return Err(ScanError::InvalidRequest("scan budget must be positive".into()));
        }
        self.budget = Some(budget);
        Ok(self)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ports(&self) -> PortRange {
        self.ports
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        self.per_attempt_timeout
    }

    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }

    /// One target per port in the range, in ascending port order.
    pub fn targets(&self) -> impl Iterator<Item = Target> + '_ {
        self.ports.iter().map(move |port| Target {
            host: self.host.clone(),
            port,
        })
    }
}

/// Why the scan stopped.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Completed,
    Cancelled,
    BudgetExhausted,
}

/// Finalized, read-only result of one scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub host: String,
    pub addr: IpAddr,
    /// Open outcomes, sorted by port.
    pub open: Vec<ScanOutcome>,
    pub scanned_total: u64,
    pub scanned_done: u64,
    pub closed_count: u64,
    pub errored_count: u64,
    pub termination: Termination,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
}

impl ScanReport {
    pub fn open_ports(&self) -> Vec<u16> {
        self.open.iter().map(ScanOutcome::port).collect()
    }

    pub fn open_count(&self) -> u64 {
        self.open.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.termination == Termination::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_validation() {
        let t = Duration::from_millis(100);
        assert!(ScanRequest::from_bounds("127.0.0.1", 1, 1024, 100, t).is_ok());
        assert!(ScanRequest::from_bounds("  ", 1, 10, 100, t).is_err());
        assert!(ScanRequest::from_bounds("h", 10, 1, 100, t).is_err());
        assert!(ScanRequest::from_bounds("h", 0, 1, 100, t).is_err());
        assert!(ScanRequest::from_bounds("h", 1, 1, 0, t).is_err());
        assert!(ScanRequest::from_bounds("h", 1, 1, 1, Duration::ZERO).is_err());

        let err = ScanRequest::from_bounds("h", 1, 1, 0, t).unwrap_err();
        assert_eq!(err.stage(), "request");
    }

    #[test]
    fn concurrency_is_clamped() {
        let req =
            ScanRequest::from_bounds("h", 1, 2, 1_000_000, Duration::from_secs(1)).unwrap();
        assert_eq!(req.max_concurrency(), MAX_CONCURRENCY);
    }

    #[test]
    fn zero_budget_rejected() {
        let req = ScanRequest::from_bounds("h", 1, 2, 1, Duration::from_secs(1)).unwrap();
        assert!(req.clone().with_budget(Duration::ZERO).is_err());
        assert_eq!(
            req.with_budget(Duration::from_secs(3)).unwrap().budget(),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn targets_cover_range() {
        let req = ScanRequest::from_bounds("example.test", 20, 25, 4, Duration::from_secs(1))
            .unwrap();
        let ports: Vec<u16> = req.targets().map(|t| t.port()).collect();
        assert_eq!(ports, vec![20, 21, 22, 23, 24, 25]);
        assert!(req.targets().all(|t| t.host() == "example.test"));
    }

    #[test]
    fn target_rejects_port_zero() {
        assert!(Target::new("h", 0).is_err());
        assert_eq!(Target::new("h", 22).unwrap().to_string(), "h:22");
    }
}
