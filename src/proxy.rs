//! Round-robin proxy pool with shared health cooldowns.
//!
//! Health state lives in the cache broker (`proxy:health:{url}` with a TTL)
//! so every worker process sees the same cooldowns. Markers are written with
//! SET NX so concurrent failures don't keep resetting the window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use url::Url;

const PROXY_HEALTH_KEY_PREFIX: &str = "proxy:health:";

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("opening proxy file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("parsing proxy URL {line:?}: {source}")]
    Parse {
        line: String,
        source: url::ParseError,
    },

    #[error("invalid proxy URL {0:?}: missing scheme or host")]
    Invalid(String),

    #[error("proxy file {0} contains no valid proxy URLs")]
    Empty(String),
}

pub struct ProxyPool {
    proxies: Vec<Url>,
    counter: AtomicU64,
    conn: Option<ConnectionManager>,
    cooldown: Duration,
}

impl ProxyPool {
    /// Load proxies from a file: one URL per line, blank lines and `#`
    /// comments skipped. Returns `None` when no path is configured.
    pub fn load(
        path: &str,
        conn: Option<ConnectionManager>,
        cooldown_secs: u64,
    ) -> Result<Option<Self>, ProxyError> {
        if path.is_empty() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ProxyError::Read {
            path: path.to_string(),
            source,
        })?;

        let mut proxies = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parsed = Url::parse(line).map_err(|source| ProxyError::Parse {
                line: line.to_string(),
                source,
            })?;
            if !parsed.has_host() {
                return Err(ProxyError::Invalid(line.to_string()));
            }
            proxies.push(parsed);
        }

        if proxies.is_empty() {
            return Err(ProxyError::Empty(path.to_string()));
        }

        Ok(Some(Self {
            proxies,
            counter: AtomicU64::new(0),
            conn,
            cooldown: Duration::from_secs(cooldown_secs),
        }))
    }

    pub fn proxies(&self) -> &[Url] {
        &self.proxies
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Next healthy proxy in round-robin order, or `None` when every proxy
    /// is cooling down (callers fall back to a direct connection). A broker
    /// error assumes healthy rather than stalling the fetch path.
    pub async fn next(&self) -> Option<&Url> {
        let n = self.proxies.len() as u64;
        let start = self.counter.fetch_add(1, Ordering::Relaxed);

        for i in 0..n {
            let proxy = &self.proxies[((start + i) % n) as usize];
            let Some(conn) = &self.conn else {
                return Some(proxy);
            };

            let key = format!("{}{}", PROXY_HEALTH_KEY_PREFIX, proxy);
            let mut conn = conn.clone();
            match conn.exists::<_, bool>(&key).await {
                Ok(false) => return Some(proxy),
                Ok(true) => continue,
                Err(e) => {
                    tracing::warn!(proxy = %proxy, error = %e, "proxy health check failed, assuming healthy");
                    return Some(proxy);
                }
            }
        }
        None
    }

    /// Start the cooldown for a failed proxy.
    pub async fn mark_unhealthy(&self, proxy: &Url) {
        let Some(conn) = &self.conn else {
            return;
        };
        let key = format!("{}{}", PROXY_HEALTH_KEY_PREFIX, proxy);
        let mut conn = conn.clone();
        let res: redis::RedisResult<()> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.cooldown.as_secs())
            .query_async(&mut conn)
            .await;
        if let Err(e) = res {
            tracing::warn!(proxy = %proxy, error = %e, "failed to mark proxy unhealthy");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn proxy_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_path_means_no_pool() {
        let pool = ProxyPool::load("", None, 60).unwrap();
        assert!(pool.is_none());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(ProxyPool::load("/nonexistent/proxies.txt", None, 60).is_err());
    }

    #[test]
    fn test_comment_only_file_is_an_error() {
        let file = proxy_file("# only comments\n\n");
        let err = ProxyPool::load(file.path().to_str().unwrap(), None, 60);
        assert!(matches!(err, Err(ProxyError::Empty(_))));
    }

    #[test]
    fn test_invalid_url_is_an_error() {
        let file = proxy_file("not-a-valid-url\n");
        assert!(ProxyPool::load(file.path().to_str().unwrap(), None, 60).is_err());
    }

    #[test]
    fn test_valid_file_loads() {
        let file = proxy_file(
            "# comment\nhttp://proxy1.example.com:8080\nhttps://proxy2.example.com:8443\n\n",
        );
        let pool = ProxyPool::load(file.path().to_str().unwrap(), None, 60)
            .unwrap()
            .unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_round_robin_without_broker() {
        let file = proxy_file(
            "http://proxy1.example.com:8080\nhttp://proxy2.example.com:8080\nhttp://proxy3.example.com:8080\n",
        );
        let pool = ProxyPool::load(file.path().to_str().unwrap(), None, 60)
            .unwrap()
            .unwrap();

        let first = pool.next().await.unwrap().to_string();
        let second = pool.next().await.unwrap().to_string();
        let third = pool.next().await.unwrap().to_string();
        let fourth = pool.next().await.unwrap().to_string();

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(first, fourth);
    }
}
