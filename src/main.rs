//! aesdsocket: a packet log server
//!
//! Listens on TCP port 9000 (by default) and, for each client:
//! - receives one newline-terminated packet
//! - appends it to a shared log file
//! - sends the whole log back and closes the connection
//!
//! Features:
//! - One worker thread per connection, all serialized on the log
//! - A timestamp line appended to the log every 10 seconds
//! - Graceful shutdown on SIGINT/SIGTERM: workers drained, log deleted
//! - Optional daemon mode (`-d`)
//! - Configuration via CLI arguments or TOML file

mod config;
mod daemon;
mod log_store;
mod protocol;
mod runtime;
mod server;
mod shutdown;

use config::Config;
use daemon::Fork;
use runtime::Listener;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let mut config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        data_file = %config.data_file.display(),
        daemon = config.daemon,
        timestamp_interval = config.timestamp_interval,
        "Starting aesdsocket server"
    );

    // Bind before forking so the invoking shell sees setup failures
    let listener = Listener::bind(&config.listen, config.backlog)?;

    if config.daemon {
        // The daemon runs from `/`, so pin the log path first
        if config.data_file.is_relative() {
            config.data_file = std::env::current_dir()?.join(&config.data_file);
        }
        if let Fork::Parent { child } = daemon::detach()? {
            info!(pid = child, "Detached into background");
            return Ok(());
        }
    }

    let server = Server::new(&config)?;
    server.run(listener)?;
    Ok(())
}
