//! Database layer: connection pool and the demo user table.
//!
//! The pool is brought up lazily, on the first verification request, so the
//! server serves static pages even when MySQL is down or unconfigured.

pub mod pool;
pub mod user;

use std::sync::{Arc, Mutex};

use crate::config::MysqlConfig;
use crate::db::pool::SqlPool;
use crate::error::Result;

/// Pool handle that connects on first use.
pub struct LazyPool {
    config: MysqlConfig,
    pool: Mutex<Option<Arc<SqlPool>>>,
}

impl LazyPool {
    pub fn new(config: MysqlConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(None),
        }
    }

    /// Returns the pool, connecting it when this is the first call. A failed
    /// attempt is not cached; the next call retries.
    pub fn get(&self) -> Result<Arc<SqlPool>> {
        let mut pool = self.pool.lock().unwrap();
        if let Some(pool) = pool.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let connected = SqlPool::connect(&self.config)?;
        *pool = Some(Arc::clone(&connected));
        Ok(connected)
    }

    /// Shuts the pool down if it was ever brought up.
    pub fn shutdown(&self) {
        if let Some(pool) = self.pool.lock().unwrap().take() {
            pool.shutdown();
        }
    }
}
