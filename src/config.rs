//! Configuration for all roles: YAML file plus environment overrides.
//!
//! Every value has a default, a YAML key, and (where operators need it) an
//! environment variable. Environment variables always win over the file.

use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub redis: RedisConfig,
    pub minio: MinioConfig,
    pub crawler: CrawlerConfig,
    pub parser: ParserConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            postgres: PostgresConfig::default(),
            redis: RedisConfig::default(),
            minio: MinioConfig::default(),
            crawler: CrawlerConfig::default(),
            parser: ParserConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_conns: usize,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "nimbus".to_string(),
            password: String::new(),
            database: "nimbus".to_string(),
            max_conns: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: String::new(),
        }
    }
}

impl RedisConfig {
    /// Connection URL in the form the redis client expects.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/", self.host, self.port)
        } else {
            format!("redis://:{}@{}:{}/", self.password, self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MinioConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub use_ssl: bool,
}

impl Default for MinioConfig {
    fn default() -> Self {
        Self {
            endpoint: "localhost:9000".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            use_ssl: false,
        }
    }
}

impl MinioConfig {
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}", scheme, self.endpoint)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub workers: usize,
    pub max_depth: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub max_redirects: usize,
    pub prefetch_count: usize,
    pub respect_robots_txt: bool,
    pub proxy: ProxyConfig,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            max_depth: 3,
            max_retries: 3,
            timeout_secs: 30,
            max_redirects: 5,
            prefetch_count: 10,
            respect_robots_txt: true,
            proxy: ProxyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub file: String,
    pub health_cooldown_s: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            file: String::new(),
            health_cooldown_s: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub workers: usize,
    pub max_depth: u32,
    pub prefetch_count: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_depth: 3,
            prefetch_count: 10,
        }
    }
}

impl Config {
    /// Load the YAML config at `path` and apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut cfg: Config = serde_yaml::from_str(&data)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Build a config from defaults and environment variables only.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        cfg
    }

    fn apply_env_overrides(&mut self) {
        env_string("POSTGRES_HOST", &mut self.postgres.host);
        env_parse("POSTGRES_PORT", &mut self.postgres.port);
        env_string("POSTGRES_USER", &mut self.postgres.user);
        env_string("POSTGRES_PASSWORD", &mut self.postgres.password);
        env_string("POSTGRES_DB", &mut self.postgres.database);
        env_parse("POSTGRES_MAX_CONNS", &mut self.postgres.max_conns);

        env_string("REDIS_HOST", &mut self.redis.host);
        env_parse("REDIS_PORT", &mut self.redis.port);
        env_string("REDIS_PASSWORD", &mut self.redis.password);

        env_string("MINIO_ENDPOINT", &mut self.minio.endpoint);
        env_string("MINIO_ACCESS_KEY", &mut self.minio.access_key);
        env_string("MINIO_SECRET_KEY", &mut self.minio.secret_key);
        env_parse("MINIO_USE_SSL", &mut self.minio.use_ssl);

        // MAX_DEPTH bounds both pipelines; the crawler drops deliveries past
        // it and the parser stops publishing discovered links at it.
        if let Ok(v) = std::env::var("MAX_DEPTH") {
            if let Ok(depth) = v.parse() {
                self.crawler.max_depth = depth;
                self.parser.max_depth = depth;
            }
        }
        if let Ok(v) = std::env::var("PREFETCH_COUNT") {
            if let Ok(count) = v.parse() {
                self.crawler.prefetch_count = count;
                self.parser.prefetch_count = count;
            }
        }

        env_parse("CRAWLER_WORKERS", &mut self.crawler.workers);
        env_parse("PARSER_WORKERS", &mut self.parser.workers);
        env_parse("MAX_RETRIES", &mut self.crawler.max_retries);
        env_parse("TIMEOUT_SECS", &mut self.crawler.timeout_secs);
        env_parse("MAX_REDIRECTS", &mut self.crawler.max_redirects);
        env_parse("RESPECT_ROBOTS_TXT", &mut self.crawler.respect_robots_txt);
        env_string("PROXY_FILE", &mut self.crawler.proxy.file);
        env_parse(
            "PROXY_HEALTH_COOLDOWN_S",
            &mut self.crawler.proxy.health_cooldown_s,
        );
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(v) = std::env::var(key) {
        if !v.is_empty() {
            *target = v;
        }
    }
}

fn env_parse<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse() {
            *target = parsed;
        }
    }
}
