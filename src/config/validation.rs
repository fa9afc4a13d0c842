//! Configuration validation.

use crate::config::Config;

/// Validate the configuration.
///
/// Checks for:
/// - Non-zero queue capacity, sniff limit, backlog and readiness attempts
/// - Non-zero timeouts where a zero value would make startup impossible
/// - A metrics path starting with `/` and a metrics address distinct from `listen`
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or every problem found joined with `; `.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.mux.queue_capacity == 0 {
        errors.push("mux.queue_capacity must be at least 1".to_string());
    }

    if config.mux.max_sniff_bytes == 0 {
        errors.push("mux.max_sniff_bytes must be at least 1".to_string());
    }

    if config.mux.sniff_timeout.is_zero() {
        errors.push("mux.sniff_timeout must be greater than zero".to_string());
    }

    if config.mux.backlog == 0 {
        errors.push("mux.backlog must be at least 1".to_string());
    }

    if config.readiness.attempts == 0 {
        errors.push("readiness.attempts must be at least 1".to_string());
    }

    if config.readiness.probe_timeout.is_zero() {
        errors.push("readiness.probe_timeout must be greater than zero".to_string());
    }

    if config.grpc.connect_timeout.is_zero() {
        errors.push("grpc.connect_timeout must be greater than zero".to_string());
    }

    if config.metrics.enabled {
        if !config.metrics.path.starts_with('/') {
            errors.push(format!(
                "metrics.path '{}' must start with '/'",
                config.metrics.path
            ));
        }

        if config.metrics.address == config.listen {
            errors.push(format!(
                "metrics.address {} collides with listen address",
                config.metrics.address
            ));
        }
    }

    if let Err(e) = validate_log_level(&config.global.log_level) {
        errors.push(e);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Check a log level from the config file or the command line.
pub fn validate_log_level(level: &str) -> Result<(), String> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        Err(format!(
            "invalid log level '{}', must be one of: {}",
            level,
            valid_levels.join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_queue_capacity() {
        let mut config = Config::default();
        config.mux.queue_capacity = 0;
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("queue_capacity"));
    }

    #[test]
    fn test_zero_readiness_attempts() {
        let mut config = Config::default();
        config.readiness.attempts = 0;
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("readiness.attempts"));
    }

    #[test]
    fn test_zero_sniff_timeout() {
        let mut config = Config::default();
        config.mux.sniff_timeout = Duration::ZERO;
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("sniff_timeout"));
    }

    #[test]
    fn test_metrics_address_collision() {
        let mut config = Config::default();
        config.metrics.enabled = true;
        config.metrics.address = config.listen;
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("collides"));
    }

    #[test]
    fn test_metrics_checks_skipped_when_disabled() {
        let mut config = Config::default();
        config.metrics.path = "metrics".to_string();
        config.metrics.address = config.listen;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.global.log_level = "loud".to_string();
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("invalid log level"));
    }

    #[test]
    fn test_log_level_override_checked() {
        assert!(validate_log_level("DEBUG").is_ok());
        assert!(validate_log_level("warn").is_ok());
        let err = validate_log_level("loud").unwrap_err();
        assert!(err.contains("invalid log level 'loud'"));
    }

    #[test]
    fn test_all_errors_reported() {
        let mut config = Config::default();
        config.mux.queue_capacity = 0;
        config.mux.backlog = 0;
        config.readiness.attempts = 0;
        let message = validate_config(&config).unwrap_err();
        assert_eq!(message.split("; ").count(), 3);
    }
}
