use crate::config::types::{Config, CrawlerConfig, FetchConfig, UserAgentConfig, WatchdogConfig};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
///
/// Seeds are validated for syntax here; whether a crawl has enough seeds to
/// start is decided by the crawler, since a resumable crawl may run from
/// existing history alone.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_fetch_config(&config.fetch)?;
    validate_watchdog_config(&config.watchdog)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_output_config(&config.output)?;
    validate_seeds(&config.seeds)?;
    validate_seeds(&config.forced_seeds)?;
    Ok(())
}

/// Validates round and pool configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.threads < 1 || config.threads > 1000 {
        return Err(ConfigError::Validation(format!(
            "threads must be between 1 and 1000, got {}",
            config.threads
        )));
    }

    if config.depth < 1 {
        return Err(ConfigError::Validation(
            "depth must be >= 1".to_string(),
        ));
    }

    if config.queue_target_size < 1 {
        return Err(ConfigError::Validation(
            "queue_target_size must be >= 1".to_string(),
        ));
    }

    if config.top_n == Some(0) {
        return Err(ConfigError::Validation(
            "top_n must be >= 1 when set".to_string(),
        ));
    }

    if config.max_execute_count < 1 {
        return Err(ConfigError::Validation(
            "max_execute_count must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates fetch configuration
fn validate_fetch_config(config: &FetchConfig) -> Result<(), ConfigError> {
    if config.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "timeout_ms must be > 0".to_string(),
        ));
    }

    if config.connect_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "connect_timeout_ms must be > 0".to_string(),
        ));
    }

    if config.max_body_bytes == 0 {
        return Err(ConfigError::Validation(
            "max_body_bytes must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Validates watchdog timings
fn validate_watchdog_config(config: &WatchdogConfig) -> Result<(), ConfigError> {
    if config.poll_interval_ms == 0 || config.spin_wait_ms == 0 {
        return Err(ConfigError::Validation(
            "poll_interval_ms and spin_wait_ms must be > 0".to_string(),
        ));
    }

    if config.hang_threshold_ms <= config.poll_interval_ms {
        return Err(ConfigError::Validation(format!(
            "hang_threshold_ms ({}) must exceed poll_interval_ms ({})",
            config.hang_threshold_ms, config.poll_interval_ms
        )));
    }

    if config.stale_lock_ms <= config.poll_interval_ms {
        return Err(ConfigError::Validation(format!(
            "stale_lock_ms ({}) must exceed poll_interval_ms ({})",
            config.stale_lock_ms, config.poll_interval_ms
        )));
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    // Validate crawler name: non-empty, alphanumeric + hyphens only
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler_name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler_name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact_url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &crate::config::types::OutputConfig) -> Result<(), ConfigError> {
    if config.crawl_path.is_empty() {
        return Err(ConfigError::Validation(
            "crawl_path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates seed URLs: absolute, http or https
fn validate_seeds(seeds: &[String]) -> Result<(), ConfigError> {
    for seed in seeds {
        let url = Url::parse(seed)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid seed URL '{}': {}", seed, e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Validation(format!(
                "Seed URL '{}' must use http or https",
                seed
            )));
        }
    }

    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    if email.is_empty() {
        return Err(ConfigError::Validation(
            "contact_email cannot be empty".to_string(),
        ));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !parts[1].contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}
