use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;
use crate::model::SUPPORTED_FORMATS;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    let queue = &config.queue;
    if queue.retry_ceiling == 0 {
        return Err(invalid("queue.retry_ceiling must be at least 1"));
    }
    if queue.default_formats.is_empty() {
        return Err(invalid("queue.default_formats must not be empty"));
    }
    for format in queue.default_formats.iter().chain(&queue.heavy_formats) {
        if !SUPPORTED_FORMATS.contains(&format.trim().to_lowercase().as_str()) {
            return Err(invalid(format!("Unsupported format '{}'", format)));
        }
    }
    if queue.max_batch == 0 {
        return Err(invalid("queue.max_batch must be at least 1"));
    }

    let tool = &config.tool;
    if tool.timeout_minutes == 0 {
        return Err(invalid("tool.timeout_minutes must be at least 1"));
    }
    if tool.timeout_secs == Some(0) {
        return Err(invalid("tool.timeout_secs must be at least 1"));
    }
    if !(1..=99).contains(&tool.progress_ceiling) {
        return Err(invalid("tool.progress_ceiling must be between 1 and 99"));
    }
    if tool.progress_interval_ms == 0 {
        return Err(invalid("tool.progress_interval_ms must be at least 1"));
    }
    if tool.interpreter.trim().is_empty() {
        return Err(invalid("tool.interpreter must not be empty"));
    }

    if config.broadcast.snapshot_limit == 0 {
        return Err(invalid("broadcast.snapshot_limit must be at least 1"));
    }
    if config.broadcast.session_buffer == 0 {
        return Err(invalid("broadcast.session_buffer must be at least 1"));
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}
