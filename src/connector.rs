use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::trace;

use crate::clock;
use crate::types::{PortState, ScanOutcome, Target};

/// A single bounded connect attempt.
///
/// Implementations must resolve every failure into a [`PortState`]; nothing
/// escapes as an error. Any socket opened must be closed before the future
/// completes.
pub trait Connector: Send + Sync + 'static {
    fn probe(&self, addr: SocketAddr, timeout: Duration) -> impl Future<Output = PortState> + Send;
}

/// Full TCP handshake via `tokio::net::TcpStream`, torn down immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn probe(&self, addr: SocketAddr, timeout: Duration) -> impl Future<Output = PortState> + Send {
        async move {
            let state = bounded_connect(TcpStream::connect(addr), timeout).await;
            trace!(%addr, %state, "probe finished");
            state
        }
    }
}

/// Drive a connect future for at most `timeout` and classify the result.
///
/// On timeout the connect future is dropped, which closes its socket; an
/// established stream is dropped before returning.
pub async fn bounded_connect<F, S>(connect: F, timeout: Duration) -> PortState
where
    F: Future<Output = std::io::Result<S>>,
{
    match time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => {
            drop(stream);
            PortState::Open
        }
        Ok(Err(e)) => {
            trace!(error = %e, "connect failed");
            classify_io_error(&e)
        }
        Err(_) => {
            trace!(?timeout, "connect timed out");
            PortState::Errored
        }
    }
}

/// Refusal means something answered with RST; everything else is inconclusive.
pub fn classify_io_error(e: &std::io::Error) -> PortState {
    match e.kind() {
        ErrorKind::ConnectionRefused => PortState::Closed,
        _ => PortState::Errored,
    }
}

/// Probe one target at an already-resolved address and stamp the outcome.
pub async fn attempt<C: Connector>(
    connector: &C,
    target: Target,
    addr: SocketAddr,
    timeout: Duration,
) -> ScanOutcome {
    let start = Instant::now();
    let state = connector.probe(addr, timeout).await;
    ScanOutcome {
        target,
        state,
        observed_at: clock::now(),
        elapsed_ms: start.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    #[test]
    fn refused_is_closed_everything_else_errored() {
        let refused = std::io::Error::from(ErrorKind::ConnectionRefused);
        assert_eq!(classify_io_error(&refused), PortState::Closed);
        for kind in [
            ErrorKind::TimedOut,
            ErrorKind::AddrNotAvailable,
            ErrorKind::PermissionDenied,
            ErrorKind::Other,
        ] {
            assert_eq!(classify_io_error(&std::io::Error::from(kind)), PortState::Errored);
        }
    }

    #[tokio::test]
    async fn loopback_listener_is_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let target = Target::new("127.0.0.1", addr.port()).unwrap();

        let outcome = attempt(&TcpConnector, target.clone(), addr, Duration::from_secs(2)).await;
        assert_eq!(outcome.state, PortState::Open);
        assert_eq!(outcome.target, target);
    }

    #[tokio::test]
    async fn dropped_listener_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let state = TcpConnector.probe(addr, Duration::from_secs(2)).await;
        assert_eq!(state, PortState::Closed);
    }

    #[tokio::test]
    async fn hung_connect_is_errored_within_timeout() {
        let timeout = Duration::from_millis(100);
        let start = std::time::Instant::now();
        let state =
            bounded_connect(std::future::pending::<std::io::Result<TcpStream>>(), timeout).await;
        assert_eq!(state, PortState::Errored);
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn refused_and_failed_connects_classify() {
        let refused = async { Err::<TcpStream, _>(std::io::Error::from(ErrorKind::ConnectionRefused)) };
        assert_eq!(bounded_connect(refused, Duration::from_secs(1)).await, PortState::Closed);
        let unreachable = async { Err::<TcpStream, _>(std::io::Error::from(ErrorKind::Other)) };
        assert_eq!(bounded_connect(unreachable, Duration::from_secs(1)).await, PortState::Errored);
    }

    #[tokio::test]
    async fn remote_target_returns_within_timeout() {
        // The state depends on the network (dropped, unreachable, or
        // intercepted by a proxy); only the time bound is fixed.
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 255, 255, 1)), 9);
        let timeout = Duration::from_millis(200);
        let start = std::time::Instant::now();
        let _ = TcpConnector.probe(addr, timeout).await;
        assert!(start.elapsed() < timeout + Duration::from_secs(1));
    }
}
