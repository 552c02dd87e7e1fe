//! Settings validation.

use super::error::{ConfigError, ConfigResult};
use super::schema::{BotSettings, LogOutput, LoggingConfig, PathsConfig, RetryConfig, Settings};

/// Validates the loaded settings.
pub fn validate_settings(settings: &Settings) -> ConfigResult<()> {
    validate_paths(&settings.paths)?;
    validate_retry(&settings.retry)?;
    validate_logging(&settings.logging)?;
    validate_bot(&settings.bot)?;
    Ok(())
}

fn validate_paths(paths: &PathsConfig) -> ConfigResult<()> {
    if paths.config.as_os_str().is_empty() {
        return Err(ConfigError::missing_field("paths.config"));
    }
    if paths.memory.as_os_str().is_empty() {
        return Err(ConfigError::missing_field("paths.memory"));
    }
    if paths.config == paths.memory {
        return Err(ConfigError::validation(
            "paths.config and paths.memory must be different files",
        ));
    }
    Ok(())
}

fn validate_retry(retry: &RetryConfig) -> ConfigResult<()> {
    if retry.max_retries == 0 {
        return Err(ConfigError::validation("retry.max_retries must be at least 1"));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }
    Ok(())
}

fn validate_bot(bot: &BotSettings) -> ConfigResult<()> {
    if bot.worker_pool_size == 0 {
        return Err(ConfigError::validation("bot.worker_pool_size must be greater than 0"));
    }
    Ok(())
}
