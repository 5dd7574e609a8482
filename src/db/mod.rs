//! Relational store access: pooled connections plus the URL/domain
//! operations. Every multi-step state transition is a single SQL statement
//! so workers on different machines can never observe half a transition.

pub mod domain;
pub mod url;

pub use domain::*;
pub use url::*;

use deadpool_postgres::{ManagerConfig, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

use crate::config::PostgresConfig;

pub type Db = deadpool_postgres::Pool;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("creating database pool: {0}")]
    Create(#[from] deadpool_postgres::CreatePoolError),

    #[error("acquiring database connection: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

/// Build the bounded connection pool and verify connectivity once.
pub async fn connect(cfg: &PostgresConfig) -> Result<Db, DbError> {
    let mut pool_cfg = deadpool_postgres::Config::new();
    pool_cfg.host = Some(cfg.host.clone());
    pool_cfg.port = Some(cfg.port);
    pool_cfg.user = Some(cfg.user.clone());
    pool_cfg.password = Some(cfg.password.clone());
    pool_cfg.dbname = Some(cfg.database.clone());
    pool_cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    pool_cfg.pool = Some(deadpool_postgres::PoolConfig::new(cfg.max_conns));

    let pool = pool_cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;

    let client = pool.get().await?;
    client.simple_query("SELECT 1").await?;
    drop(client);

    Ok(pool)
}
