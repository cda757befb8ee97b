use std::{path::Path, time::SystemTime};

use relay_models::errors::SendableError;

/// Device tokens are long-lived credentials; logs only ever carry a prefix.
const TOKEN_PREFIX_LEN: usize = 20;

pub fn setup_logger(level: log::LevelFilter, log_file: Option<&Path>) -> Result<(), SendableError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("sqlx", log::LevelFilter::Warn)
        .chain(std::io::stdout());

    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }
    dispatch.apply()?;
    Ok(())
}

/// First characters of a device token followed by an ellipsis.
pub fn redact_token(token: &str) -> String {
    match token.char_indices().nth(TOKEN_PREFIX_LEN) {
        Some((cut, _)) => format!("{}...", &token[..cut]),
        None => token.to_string(),
    }
}
