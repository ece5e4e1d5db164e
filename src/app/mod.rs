mod config;
mod error;
mod logging;
mod runtime;

pub mod dispatcher;
pub mod engine;
pub mod monitor;
pub mod poller;
pub mod recorder;

pub use error::AppError;

pub fn run() -> Result<(), AppError> {
    dotenvy::dotenv().ok();

    logging::init()?;

    let config = config::AppConfig::from_env()?;

    tracing::info!(
        enode_base_url = %config.enode_base_url,
        webhook_url = %config.webhook_url,
        db_path = %config.db_path,
        http_bind = %config.http_bind,
        poll_interval_secs = config.poll_interval_secs,
        monitor_interval_secs = config.monitor_interval_secs,
        "application bootstrap initialized"
    );

    runtime::run(config)
}
