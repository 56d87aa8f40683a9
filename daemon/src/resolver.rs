//! Hostname resolution with a per-name timeout

use futures::future::join_all;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct Resolver {
    timeout: Duration,
}

impl Resolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve every name concurrently; results keep input order.
    ///
    /// Failed or timed-out names yield an empty string.
    pub async fn resolve_all(&self, names: &[String]) -> Vec<String> {
        join_all(names.iter().map(|name| self.resolve(name))).await
    }

    /// Comma-and-space joined addresses for one name
    pub async fn resolve(&self, name: &str) -> String {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return ip.to_string();
        }

        let lookup = tokio::net::lookup_host((name, 0));
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(addrs)) => {
                let mut seen: Vec<IpAddr> = Vec::new();
                for addr in addrs {
                    if !seen.contains(&addr.ip()) {
                        seen.push(addr.ip());
                    }
                }
                seen.iter()
                    .map(|ip| ip.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            }
            Ok(Err(e)) => {
                debug!("Resolve {} failed: {}", name, e);
                String::new()
            }
            Err(_) => {
                debug!("Resolve {} timed out", name);
                String::new()
            }
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}
