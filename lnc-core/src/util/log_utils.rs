use anyhow::{anyhow, Result};

/// Name for each log level, quietest first
pub const LOG_LEVEL_FILTER_NAMES: [&str; 6] = ["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"];

/// Parse a log level name, case insensitive, to a level filter
pub fn parse_log_level_filter(lvlstr: &str) -> Result<log::LevelFilter> {
    lvlstr.parse::<log::LevelFilter>().map_err(|_| anyhow!("invalid log level: {}", lvlstr))
}
