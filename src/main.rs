use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};

use hearth::config::{Config, DEFAULT_CONFIG_PATH};
use hearth::db::LazyPool;
use hearth::logger;
use hearth::server::{Server, ServerContext};
use hearth::site::Site;

fn main() -> ExitCode {
    // A peer resetting mid-write must surface as EPIPE from the syscall, not
    // kill the process.
    // SAFETY: installing SIG_IGN for SIGPIPE has no handler to race with.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {err}");
            eprintln!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> hearth::Result<()> {
    let config = Config::load(Path::new(DEFAULT_CONFIG_PATH))?;
    let logging = logger::init(&config.log)?;

    let site = Site::load(Path::new(&config.site.path))?;
    let ctx = Arc::new(ServerContext::new(
        site,
        LazyPool::new(config.mysql.clone()),
    ));

    let mut server = Server::from_config(&config, Arc::clone(&ctx))?;
    info!("========== server start ==========");
    let result = server.run();

    ctx.db().shutdown();
    if let Some(logging) = logging {
        logging.stop();
    }
    result
}
