use crate::aggregator::{Aggregator, SharedProgress};
use crate::connector::{attempt, Connector, TcpConnector};
use crate::error::Result;
use crate::resolver::{Resolver, SystemResolver};
use crate::types::{ScanOutcome, ScanReport, ScanRequest, Termination};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives every recorded outcome, in completion order.
pub type OutcomeSender = mpsc::UnboundedSender<ScanOutcome>;

/// Scan a request with the given connector and the system resolver.
pub async fn scan<C: Connector>(request: &ScanRequest, connector: C) -> Result<ScanReport> {
    Scanner::with_parts(connector, SystemResolver)
        .scan(request)
        .await
}

/// Bounded-concurrency TCP connect scheduler.
///
/// - Resolves the host once and fails fast if that fails.
/// - Limits in-flight attempts using a `Semaphore`; one task per port.
/// - Uses `tokio::time::timeout` inside the connector for the per-port bound.
/// - Honors a `CancellationToken` and the request's optional budget, returning
///   whatever was recorded before either fired.
pub struct Scanner<C = TcpConnector, R = SystemResolver> {
    connector: Arc<C>,
    resolver: R,
    events: Option<OutcomeSender>,
    progress: SharedProgress,
}

impl Scanner {
    pub fn new() -> Self {
        Self::with_parts(TcpConnector, SystemResolver)
    }
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector, R: Resolver> Scanner<C, R> {
    pub fn with_parts(connector: C, resolver: R) -> Self {
        Self {
            connector: Arc::new(connector),
            resolver,
            events: None,
            progress: SharedProgress::new(),
        }
    }

    /// Forward each recorded outcome to `tx`. A dropped receiver is ignored.
    pub fn with_events(mut self, tx: OutcomeSender) -> Self {
        self.events = Some(tx);
        self
    }

    /// Share live counters with the caller. They are zeroed at the start of
    /// every scan; concurrent scans on one `Scanner` share them.
    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &SharedProgress {
        &self.progress
    }

    pub async fn scan(&self, request: &ScanRequest) -> Result<ScanReport> {
        self.scan_with_cancel(request, CancellationToken::new()).await
    }

    pub async fn scan_with_cancel(
        &self,
        request: &ScanRequest,
        cancel: CancellationToken,
    ) -> Result<ScanReport> {
        let ip = self.resolver.resolve(request.host()).await?;
        let total = request.ports().len();
        info!(
            host = request.host(),
            %ip,
            ports = %request.ports(),
            concurrency = request.max_concurrency(),
            timeout_ms = request.per_attempt_timeout().as_millis() as u64,
            "scan started"
        );

        self.progress.reset();
        let aggregator = Arc::new(Aggregator::with_progress(
            request.host(),
            ip,
            total,
            self.progress.clone(),
        ));
        let token = cancel.child_token();

        let budget_hit = Arc::new(AtomicBool::new(false));
        let budget_timer = request.budget().map(|budget| {
            let token = token.clone();
            let budget_hit = budget_hit.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = time::sleep(budget) => {
                        budget_hit.store(true, Ordering::Relaxed);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });

        let sem = Arc::new(Semaphore::new(request.max_concurrency()));
        let timeout = request.per_attempt_timeout();
        let mut set = JoinSet::new();

        for target in request.targets() {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let connector = self.connector.clone();
            let aggregator = aggregator.clone();
            let events = self.events.clone();
            let token = token.clone();

            set.spawn(async move {
                let _permit = permit; // keep permit until task completes
                let addr = SocketAddr::new(ip, target.port());
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    o = attempt(connector.as_ref(), target, addr, timeout) => o,
                };
                debug!(
                    host = outcome.target.host(),
                    port = outcome.port(),
                    state = %outcome.state,
                    elapsed_ms = outcome.elapsed_ms,
                    "attempt finished"
                );
                if aggregator.record(outcome.clone()).await {
                    if let Some(tx) = events {
                        let _ = tx.send(outcome);
                    }
                }
            });
        }

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "scan task failed");
            }
        }
        if let Some(timer) = budget_timer {
            timer.abort();
        }

        let done = aggregator.recorded().await;
        let termination = if done >= total {
            Termination::Completed
        } else if budget_hit.load(Ordering::Relaxed) {
            Termination::BudgetExhausted
        } else {
            Termination::Cancelled
        };
        let report = aggregator.finalize(termination).await;
        info!(
            host = %report.host,
            open = report.open_count(),
            closed = report.closed_count,
            errored = report.errored_count,
            done = report.scanned_done,
            total = report.scanned_total,
            termination = ?report.termination,
            "scan finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortState;
    use std::collections::HashSet;
    use std::future::Future;
    use std::net::IpAddr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Fixed open set; other even ports refuse, odd ones error. Tracks peak concurrency.
    #[derive(Clone, Default)]
    struct FakeConnector {
        open: Arc<HashSet<u16>>,
        delay: Duration,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl FakeConnector {
        fn new(open: &[u16], delay: Duration) -> Self {
            Self {
                open: Arc::new(open.iter().copied().collect()),
                delay,
                ..Default::default()
            }
        }
    }

    impl Connector for FakeConnector {
        fn probe(
            &self,
            addr: SocketAddr,
            _timeout: Duration,
        ) -> impl Future<Output = PortState> + Send {
            let this = self.clone();
            async move {
                this.calls.fetch_add(1, Ordering::SeqCst);
                let now = this.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                this.peak.fetch_max(now, Ordering::SeqCst);
                time::sleep(this.delay).await;
                this.in_flight.fetch_sub(1, Ordering::SeqCst);
                if this.open.contains(&addr.port()) {
                    PortState::Open
                } else if addr.port() % 2 == 0 {
                    PortState::Closed
                } else {
                    PortState::Errored
                }
            }
        }
    }

    fn request(start: u16, end: u16, concurrency: usize) -> ScanRequest {
        ScanRequest::from_bounds("127.0.0.1", start, end, concurrency, Duration::from_millis(50))
            .unwrap()
    }

    #[tokio::test]
    async fn every_port_is_resolved_exactly_once() {
        let fake = FakeConnector::new(&[100, 150], Duration::from_millis(1));
        let calls = fake.calls.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scanner = Scanner::with_parts(fake, SystemResolver).with_events(tx);

        let report = scanner.scan(&request(100, 199, 16)).await.unwrap();
        drop(scanner);

        let mut seen = Vec::new();
        while let Some(o) = rx.recv().await {
            seen.push(o.port());
        }
        seen.sort_unstable();
        assert_eq!(seen, (100..=199).collect::<Vec<_>>());
        assert_eq!(calls.load(Ordering::SeqCst), 100);
        assert_eq!(report.scanned_done, 100);
        assert_eq!(report.open_count() + report.closed_count + report.errored_count, 100);
        assert_eq!(report.open_ports(), vec![100, 150]);
        assert_eq!(report.termination, Termination::Completed);
        assert_eq!(report.addr, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let fake = FakeConnector::new(&[], Duration::from_millis(5));
        let peak = fake.peak.clone();
        let scanner = Scanner::with_parts(fake, SystemResolver);
        scanner.scan(&request(1, 200, 8)).await.unwrap();
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 8, "peak in-flight was {peak}");
        assert!(peak >= 2, "expected some parallelism, peak was {peak}");
    }

    #[tokio::test]
    async fn sequential_is_concurrency_one() {
        let fake = FakeConnector::new(&[3], Duration::from_millis(1));
        let peak = fake.peak.clone();
        let report = Scanner::with_parts(fake, SystemResolver)
            .scan(&request(1, 10, 1))
            .await
            .unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(report.open_ports(), vec![3]);
    }

    #[tokio::test]
    async fn budget_stops_the_scan() {
        let fake = FakeConnector::new(&[1], Duration::from_millis(50));
        let req = request(1, 1000, 4)
            .with_budget(Duration::from_millis(120))
            .unwrap();
        let started = std::time::Instant::now();
        let report = Scanner::with_parts(fake, SystemResolver)
            .scan(&req)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.termination, Termination::BudgetExhausted);
        assert!(report.scanned_done < 1000);
        assert_eq!(report.open_ports(), vec![1]);
    }

    #[tokio::test]
    async fn reused_scanner_reports_cancellation_of_second_scan() {
        let fake = FakeConnector::new(&[], Duration::from_millis(20));
        let scanner = Scanner::with_parts(fake, SystemResolver);

        let first = scanner.scan(&request(1, 100, 100)).await.unwrap();
        assert_eq!(first.termination, Termination::Completed);
        assert_eq!(scanner.progress().snapshot().0, 100);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let second = scanner
            .scan_with_cancel(&request(1, 100, 10), cancel)
            .await
            .unwrap();
        assert_eq!(second.termination, Termination::Cancelled);
        assert!(second.scanned_done < 100);
        assert_eq!(scanner.progress().snapshot().0, second.scanned_done);
    }

    #[tokio::test]
    async fn pre_cancelled_scan_dispatches_nothing() {
        let fake = FakeConnector::new(&[], Duration::ZERO);
        let calls = fake.calls.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = Scanner::with_parts(fake, SystemResolver)
            .scan_with_cancel(&request(1, 100, 10), cancel)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.scanned_done, 0);
        assert_eq!(report.termination, Termination::Cancelled);
    }
}
