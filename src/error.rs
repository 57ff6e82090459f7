//! Error kinds shared across the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("database error: {0}")]
    Db(#[from] mysql::Error),

    #[error("database pool exhausted")]
    PoolExhausted,

    #[error("database pool is shut down")]
    PoolClosed,

    #[error("site path error: {0}")]
    Site(String),
}
