use std::future::Future;
use std::net::IpAddr;

use tokio::net::lookup_host;

use crate::error::{Result, ScanError};

/// Maps a host name (or literal address) to a single IP address.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(&self, host: &str) -> impl Future<Output = Result<IpAddr>> + Send;
}

/// Resolver backed by the operating system. Literal addresses skip the
/// lookup; names prefer the first IPv4 answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str) -> impl Future<Output = Result<IpAddr>> + Send {
        let host = host.trim().to_string();
        async move {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return Ok(ip);
            }
            let addrs: Vec<IpAddr> = lookup_host((host.as_str(), 0))
                .await
                .map_err(|e| ScanError::Resolution {
                    host: host.clone(),
                    reason: e.to_string(),
                })?
                .map(|sa| sa.ip())
                .collect();
            pick_address(&addrs).ok_or_else(|| ScanError::Resolution {
                host,
                reason: "no addresses returned".into(),
            })
        }
    }
}

fn pick_address(addrs: &[IpAddr]) -> Option<IpAddr> {
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}
