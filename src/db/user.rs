//! Demo user verification backing the login/register form.

use std::sync::Arc;

use log::{info, warn};
use mysql::prelude::Queryable;

use crate::db::pool::SqlPool;
use crate::error::Result;

const CREATE_USER_TABLE: &str = "CREATE TABLE IF NOT EXISTS `user` (
    username VARCHAR(255) NOT NULL PRIMARY KEY,
    password VARCHAR(255) NOT NULL
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

/// Checks credentials against the `user` table. For a login, the stored
/// password must match; for a registration, the username must be free and is
/// inserted. Returns `Ok(false)` for plain verification failures and `Err`
/// only when the database itself is unavailable.
pub fn verify(pool: &Arc<SqlPool>, username: &str, password: &str, is_login: bool) -> Result<bool> {
    if username.is_empty() || password.is_empty() {
        warn!("verification with empty username or password");
        return Ok(false);
    }
    let mut conn = pool.acquire()?;
    conn.query_drop(CREATE_USER_TABLE)?;

    let row: Option<(String, String)> = conn.exec_first(
        "SELECT username, password FROM `user` WHERE username = ? LIMIT 1",
        (username,),
    )?;

    if is_login {
        match row {
            Some((_, stored)) if stored == password => {
                info!("user `{username}` logged in");
                Ok(true)
            }
            Some(_) => {
                warn!("wrong password for user `{username}`");
                Ok(false)
            }
            None => {
                warn!("unknown user `{username}`");
                Ok(false)
            }
        }
    } else if row.is_some() {
        warn!("username `{username}` already taken");
        Ok(false)
    } else {
        conn.exec_drop(
            "INSERT INTO `user` (username, password) VALUES (?, ?)",
            (username, password),
        )?;
        info!("user `{username}` registered");
        Ok(true)
    }
}
