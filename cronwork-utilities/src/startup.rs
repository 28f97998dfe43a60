use std::env;

use cronwork_models::errors::SendableError;
use log::info;

use crate::logger;

/// Process-level initialization shared by cronwork binaries: logging,
/// panic capture, and a startup banner.
pub fn startup(name: &str) -> Result<(), SendableError> {
    logger::setup_logger()?;
    log_panics::init();

    info!("--- {} ---", name);
    let cwd = env::current_dir()?;
    info!("Current working directory: {}", cwd.display());

    Ok(())
}
