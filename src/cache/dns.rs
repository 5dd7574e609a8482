//! DNS cache with SSRF defense.
//!
//! Resolutions are cached in the shared broker under `dns:{host}` with a
//! short TTL. Any address that is loopback, private, link-local, multicast,
//! or unspecified is rejected, on cache hit as well as miss, so a hostile
//! DNS answer can never steer the fetcher at internal infrastructure.
//! Failed resolutions are never cached.

use std::net::IpAddr;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

const DNS_TTL_SECS: u64 = 5 * 60;
const DNS_KEY_PREFIX: &str = "dns:";

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("dns lookup {host}: {source}")]
    Lookup {
        host: String,
        source: std::io::Error,
    },

    #[error("no addresses for {0}")]
    NoAddresses(String),

    #[error("{host} resolved to non-public address {addr}")]
    NonPublicAddress { host: String, addr: String },
}

#[derive(Clone)]
pub struct DnsCache {
    conn: ConnectionManager,
}

impl DnsCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn lookup_host(&self, host: &str) -> Result<IpAddr, DnsError> {
        let key = format!("{}{}", DNS_KEY_PREFIX, host);
        let mut conn = self.conn.clone();

        let cached: Option<String> = conn.get(&key).await?;
        if let Some(cached) = cached {
            // An unparseable cached value counts as non-public: reject it.
            let addr = cached.parse::<IpAddr>().ok().filter(|a| !is_private_addr(a));
            return addr.ok_or(DnsError::NonPublicAddress {
                host: host.to_string(),
                addr: cached,
            });
        }

        let mut addrs = tokio::net::lookup_host((host, 0u16))
            .await
            .map_err(|source| DnsError::Lookup {
                host: host.to_string(),
                source,
            })?;
        let addr = addrs
            .next()
            .map(|sa| sa.ip())
            .ok_or_else(|| DnsError::NoAddresses(host.to_string()))?;

        if is_private_addr(&addr) {
            return Err(DnsError::NonPublicAddress {
                host: host.to_string(),
                addr: addr.to_string(),
            });
        }

        // Return the address even if caching it fails.
        let cache_write: redis::RedisResult<()> =
            conn.set_ex(&key, addr.to_string(), DNS_TTL_SECS).await;
        if let Err(e) = cache_write {
            tracing::debug!(error = %e, host, "failed to cache dns result");
        }

        Ok(addr)
    }
}

/// True when the address must never be dialed by the fetcher.
pub fn is_private_addr(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() || v6.is_multicast() {
                return true;
            }
            let seg = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link local
            (seg & 0xfe00) == 0xfc00 || (seg & 0xffc0) == 0xfe80
        }
    }
}
