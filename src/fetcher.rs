//! HTTP fetcher: long-lived clients, DNS-cached dialing, proxy rotation.
//!
//! One shared client per destination kind (direct plus one per proxy) so
//! connection pools survive across requests. The DNS cache plugs in as a
//! custom resolver, which is where the SSRF filter bites: a URL whose host
//! resolves to a private address never gets a socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::{header, redirect, Client, Proxy};
use url::Url;

use crate::cache::DnsCache;
use crate::proxy::ProxyPool;
use crate::robots::CRAWLER_USER_AGENT;

/// Body bytes past this cap are silently dropped.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_PER_HOST: usize = 10;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const ACCEPT_HEADER: &str = "text/html,application/xhtml+xml";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("connection error: {0}")]
    Connect(String),

    #[error("redirect limit exceeded: {0}")]
    TooManyRedirects(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected content-type {content_type:?} for {url}")]
    UnexpectedContentType { content_type: String, url: String },

    #[error("reading response body: {0}")]
    Body(String),

    #[error("building http client: {0}")]
    ClientBuild(String),
}

impl FetchError {
    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FetchError::Timeout
        } else if error.is_redirect() {
            FetchError::TooManyRedirects(error.to_string())
        } else if error.is_connect() {
            FetchError::Connect(error.to_string())
        } else {
            FetchError::Network(error.to_string())
        }
    }

    /// Transport-level failures are the only ones that count against a
    /// proxy's health; an HTTP status (any, 5xx included) or a content-type
    /// mismatch is a real answer from the origin.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout | FetchError::Connect(_) | FetchError::Network(_)
        )
    }
}

#[derive(Debug)]
pub struct FetchResponse {
    pub body: Vec<u8>,
    pub status: u16,
}

/// Adapts the broker-backed DNS cache to reqwest's resolver seam.
struct CachedResolver(Arc<DnsCache>);

impl Resolve for CachedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let dns = Arc::clone(&self.0);
        Box::pin(async move {
            let ip = dns
                .lookup_host(name.as_str())
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
            // Port 0 is a placeholder; reqwest substitutes the URL's port.
            let addrs: Addrs = Box::new(std::iter::once(SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}

pub struct Fetcher {
    direct: Client,
    proxy_clients: HashMap<String, Client>,
    proxy_pool: Option<ProxyPool>,
}

impl Fetcher {
    /// Build the direct client and one client per configured proxy.
    /// `dns` of `None` falls back to system resolution (tests, tooling);
    /// production wiring always passes the cache.
    pub fn new(
        dns: Option<Arc<DnsCache>>,
        proxy_pool: Option<ProxyPool>,
        timeout_secs: u64,
        max_redirects: usize,
    ) -> Result<Self, FetchError> {
        let direct = Self::build_client(dns.clone(), None, timeout_secs, max_redirects)?;

        let mut proxy_clients = HashMap::new();
        if let Some(pool) = &proxy_pool {
            for proxy in pool.proxies() {
                let client =
                    Self::build_client(dns.clone(), Some(proxy), timeout_secs, max_redirects)?;
                proxy_clients.insert(proxy.to_string(), client);
            }
        }

        Ok(Self {
            direct,
            proxy_clients,
            proxy_pool,
        })
    }

    fn build_client(
        dns: Option<Arc<DnsCache>>,
        proxy: Option<&Url>,
        timeout_secs: u64,
        max_redirects: usize,
    ) -> Result<Client, FetchError> {
        let mut builder = Client::builder()
            .user_agent(CRAWLER_USER_AGENT)
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(DIAL_TIMEOUT)
            .pool_max_idle_per_host(POOL_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .redirect(redirect::Policy::limited(max_redirects));

        if let Some(dns) = dns {
            builder = builder.dns_resolver(Arc::new(CachedResolver(dns)));
        }
        if let Some(proxy) = proxy {
            let proxy =
                Proxy::all(proxy.as_str()).map_err(|e| FetchError::ClientBuild(e.to_string()))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| FetchError::ClientBuild(e.to_string()))
    }

    /// Fetch a URL, rotating through healthy proxies when a pool is
    /// configured. A proxy transport failure marks it unhealthy and retries
    /// once through the next proxy, then falls back to direct.
    pub async fn fetch(&self, raw_url: &str) -> Result<FetchResponse, FetchError> {
        let Some(pool) = &self.proxy_pool else {
            return self.do_fetch(&self.direct, raw_url).await;
        };

        let Some(proxy) = pool.next().await else {
            tracing::warn!(url = raw_url, "all proxies unhealthy, falling back to direct");
            return self.do_fetch(&self.direct, raw_url).await;
        };

        let Some(client) = self.proxy_clients.get(proxy.as_str()) else {
            tracing::error!(proxy = %proxy, "no http client for proxy");
            return self.do_fetch(&self.direct, raw_url).await;
        };

        match self.do_fetch(client, raw_url).await {
            Err(e) if e.is_transport() => {
                pool.mark_unhealthy(proxy).await;
                tracing::warn!(proxy = %proxy, url = raw_url, error = %e, "proxy failed, retrying with next");

                match pool.next().await {
                    Some(next) => match self.proxy_clients.get(next.as_str()) {
                        Some(next_client) => self.do_fetch(next_client, raw_url).await,
                        None => self.do_fetch(&self.direct, raw_url).await,
                    },
                    None => self.do_fetch(&self.direct, raw_url).await,
                }
            }
            other => other,
        }
    }

    async fn do_fetch(&self, client: &Client, raw_url: &str) -> Result<FetchResponse, FetchError> {
        let resp = client
            .get(raw_url)
            .header(header::ACCEPT, ACCEPT_HEADER)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = resp.status().as_u16();

        if let Some(content_type) = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            let media_type = content_type
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase();
            if !media_type.is_empty()
                && !media_type.starts_with("text/")
                && media_type != "application/xhtml+xml"
            {
                return Err(FetchError::UnexpectedContentType {
                    content_type: media_type,
                    url: raw_url.to_string(),
                });
            }
        }

        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Body(e.to_string()))?;
            let remaining = MAX_BODY_BYTES - body.len();
            if chunk.len() >= remaining {
                body.extend_from_slice(&chunk[..remaining]);
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchResponse { body, status })
    }
}
