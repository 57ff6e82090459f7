//! YAML configuration.
//!
//! The file is created with commented defaults on first run, then loaded
//! strictly: a missing key is a startup error, not a silent default.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "./config/config.yml";

const DEFAULT_CONFIG: &str = r#"server:
    # listen port
    port: 6666
    # idle connection timeout, milliseconds
    timeout: 60000

mysql:
    host: 127.0.0.1
    port: 3306
    user: root
    password: 123456
    db: hearth_db
    # initial pool size
    pool_size: 12
    # pool lower bound, monitor shrinks idle connections down to this
    pool_min_size: 6
    # pool upper bound, checkout blocks once reached
    pool_max_size: 24

log:
    directory: ./log
    # 1:debug 2:info 3:warning 4:error 5:none
    level: 2
    # single file roll size, MiB
    size: 64
    basename: hearth
    # ANSI colors; keep off when logging to a file
    colorful: false
    # true: async logger to file, false: stdout
    output_to_file: true

site:
    # static site root
    path: ./dist
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub mysql: MysqlConfig,
    pub log: LogConfig,
    pub site: SiteConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    /// Idle timeout in milliseconds; 0 disables idle timeouts.
    pub timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db: String,
    pub pool_size: usize,
    pub pool_min_size: usize,
    pub pool_max_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub directory: String,
    pub level: u8,
    /// Roll size in MiB.
    pub size: u64,
    pub basename: String,
    pub colorful: bool,
    pub output_to_file: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub path: String,
}

impl Config {
    /// Loads `path`, writing the default file first when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            eprintln!("{} does not exist, writing defaults", path.display());
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(path, DEFAULT_CONFIG)?;
        }
        let raw = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&raw)?;
        if config.log.basename.contains('/') {
            return Err(Error::Config("log.basename must not contain '/'".into()));
        }
        Ok(config)
    }
}
