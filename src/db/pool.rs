//! Bounded MySQL connection pool with health monitoring and scoped checkout.

use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use mysql::prelude::Queryable;
use mysql::{Conn, Opts, OptsBuilder};

use crate::config::MysqlConfig;
use crate::error::{Error, Result};

/// Server error for "unknown database", the driver's signal that the target
/// schema must be created first.
const ER_BAD_DB: u16 = 1049;

const MONITOR_INTERVAL: Duration = Duration::from_secs(60);

struct PoolState {
    idle: VecDeque<Conn>,
    /// Connections currently checked out.
    used: usize,
    /// `idle.len() + used`, bounded by `max` outside transient acquisition.
    total: usize,
    shutdown: bool,
}

pub struct SqlPool {
    opts: Opts,
    min: usize,
    max: usize,
    state: Mutex<PoolState>,
    available: Condvar,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SqlPool {
    /// Ensures the database exists, opens `pool_size` connections, and starts
    /// the monitor thread.
    pub fn connect(config: &MysqlConfig) -> Result<Arc<Self>> {
        ensure_database(config)?;

        let opts: Opts = OptsBuilder::new()
            .ip_or_hostname(Some(config.host.clone()))
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .db_name(Some(config.db.clone()))
            .into();

        let mut idle = VecDeque::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            match Conn::new(opts.clone()) {
                Ok(conn) => idle.push_back(conn),
                Err(err) => error!("failed to open pooled connection: {err}"),
            }
        }
        let total = idle.len();
        info!("sql pool initialized with {total} connections");

        let pool = Arc::new(Self {
            opts,
            min: config.pool_min_size,
            max: config.pool_max_size,
            state: Mutex::new(PoolState {
                idle,
                used: 0,
                total,
                shutdown: false,
            }),
            available: Condvar::new(),
            monitor: Mutex::new(None),
        });

        let monitor = {
            let pool = Arc::downgrade(&pool);
            thread::Builder::new()
                .name("sql-monitor".into())
                .spawn(move || monitor_loop(pool))?
        };
        *pool.monitor.lock().unwrap() = Some(monitor);
        Ok(pool)
    }

    /// Checks a connection out. Takes an idle one when available, opens a new
    /// one below `max`, and otherwise blocks until a holder returns one.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledConn> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return Err(Error::PoolClosed);
            }
            if let Some(conn) = state.idle.pop_front() {
                state.used += 1;
                return Ok(PooledConn {
                    conn: ManuallyDrop::new(conn),
                    pool: Arc::clone(self),
                });
            }
            if state.total < self.max {
                // Count the slot before connecting so concurrent acquirers
                // cannot overshoot `max`, release the lock for the handshake.
                state.total += 1;
                state.used += 1;
                drop(state);
                match Conn::new(self.opts.clone()) {
                    Ok(conn) => {
                        return Ok(PooledConn {
                            conn: ManuallyDrop::new(conn),
                            pool: Arc::clone(self),
                        })
                    }
                    Err(err) => {
                        let mut state = self.state.lock().unwrap();
                        state.total -= 1;
                        state.used -= 1;
                        drop(state);
                        self.available.notify_one();
                        error!("failed to grow sql pool: {err}");
                        return Err(Error::PoolExhausted);
                    }
                }
            }
            state = self.available.wait(state).unwrap();
        }
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().unwrap().idle.len()
    }

    pub fn total_count(&self) -> usize {
        self.state.lock().unwrap().total
    }

    /// Stops the monitor and closes every idle connection. Checked-out
    /// connections are closed as their holders drop them.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.idle.clear();
            state.total = state.used;
        }
        self.available.notify_all();
        if let Some(monitor) = self.monitor.lock().unwrap().take() {
            // The last Arc can be dropped by the monitor itself; joining the
            // current thread would deadlock.
            if monitor.thread().id() != thread::current().id() {
                let _ = monitor.join();
            }
        }
        info!("sql pool shut down");
    }

    fn release(&self, conn: Conn) {
        let mut state = self.state.lock().unwrap();
        state.used -= 1;
        if state.shutdown {
            state.total -= 1;
            return;
        }
        state.idle.push_back(conn);
        drop(state);
        self.available.notify_one();
    }

    /// One monitor pass: ping idle connections, replace or drop the dead,
    /// then shrink surplus idle connections down to `min`.
    fn health_check(&self) {
        let mut checked = VecDeque::new();
        loop {
            let conn = {
                let mut state = self.state.lock().unwrap();
                if state.shutdown {
                    return;
                }
                match state.idle.pop_front() {
                    Some(conn) => conn,
                    None => break,
                }
            };
            match ping(conn) {
                Some(conn) => checked.push_back(conn),
                None => {
                    warn!("sql connection lost, reconnecting");
                    match Conn::new(self.opts.clone()) {
                        Ok(conn) => checked.push_back(conn),
                        Err(err) => {
                            error!("failed to replace sql connection: {err}");
                            let mut state = self.state.lock().unwrap();
                            state.total -= 1;
                        }
                    }
                }
            }
        }

        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        // Put survivors back, then drop surplus idle handles down to min.
        state.idle.append(&mut checked);
        while state.idle.len() > self.min {
            state.idle.pop_back();
            state.total -= 1;
        }
        debug!(
            "sql pool after health check: {} idle / {} total",
            state.idle.len(),
            state.total
        );
        drop(state);
        self.available.notify_all();
    }
}

impl Drop for SqlPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Scoped checkout: derefs to [`Conn`] and returns it to the pool on drop.
pub struct PooledConn {
    conn: ManuallyDrop<Conn>,
    pool: Arc<SqlPool>,
}

impl Deref for PooledConn {
    type Target = Conn;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        // SAFETY: conn is never touched again after this take.
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        self.pool.release(conn);
    }
}

/// Liveness probe; consumes the connection when the probe fails.
fn ping(mut conn: Conn) -> Option<Conn> {
    match conn.query_drop("SELECT 1") {
        Ok(()) => Some(conn),
        Err(_) => None,
    }
}

/// Connects with the configured database name and, when the server reports
/// the schema as absent, reconnects database-less to create it.
fn ensure_database(config: &MysqlConfig) -> Result<()> {
    let with_db: Opts = OptsBuilder::new()
        .ip_or_hostname(Some(config.host.clone()))
        .tcp_port(config.port)
        .user(Some(config.user.clone()))
        .pass(Some(config.password.clone()))
        .db_name(Some(config.db.clone()))
        .into();
    match Conn::new(with_db) {
        Ok(_) => Ok(()),
        Err(mysql::Error::MySqlError(ref server_err)) if server_err.code == ER_BAD_DB => {
            info!("database `{}` does not exist, creating it", config.db);
            let without_db: Opts = OptsBuilder::new()
                .ip_or_hostname(Some(config.host.clone()))
                .tcp_port(config.port)
                .user(Some(config.user.clone()))
                .pass(Some(config.password.clone()))
                .into();
            let mut conn = Conn::new(without_db)?;
            conn.query_drop(format!(
                "CREATE DATABASE `{}` CHARACTER SET utf8mb4 COLLATE utf8mb4_general_ci",
                config.db
            ))?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn monitor_loop(pool: Weak<SqlPool>) {
    loop {
        // Sleep in one-second slices so shutdown is noticed promptly.
        for _ in 0..MONITOR_INTERVAL.as_secs() {
            thread::sleep(Duration::from_secs(1));
            match pool.upgrade() {
                Some(pool) => {
                    if pool.state.lock().unwrap().shutdown {
                        return;
                    }
                }
                None => return,
            }
        }
        match pool.upgrade() {
            Some(pool) => pool.health_check(),
            None => return,
        }
    }
}
