//! turnstile server binary.

use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::Config;
use turnstile::server;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        threads = config.effective_threads(),
        maxclients = config.maxclients,
        "starting turnstile"
    );

    let handle = server::spawn(config)?;
    handle.wait();
    Ok(())
}
