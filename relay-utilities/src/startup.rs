use std::path::Path;

use log::info;
use relay_models::errors::SendableError;

use crate::logger;

pub fn startup(name: &str, level: log::LevelFilter, log_file: Option<&Path>) -> Result<(), SendableError> {
    logger::setup_logger(level, log_file)?;
    log_panics::init();

    info!("--- {} ---", name);
    if let Some(path) = log_file {
        info!("Writing logs to {}", path.display());
    }
    Ok(())
}
