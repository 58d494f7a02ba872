use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use warden_config::{LogFormat, LoggingConfig};

static ACTIVE_FILTER: OnceCell<String> = OnceCell::new();

/// Filter string of the subscriber installed by this crate, if any
pub fn active_filter() -> Option<&'static str> {
    ACTIVE_FILTER.get().map(String::as_str)
}

/// Initialize logging from configuration
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<()> {
    let filter = config.filter_string();
    let env_filter = build_filter(&filter);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    // Use try_init to avoid panic if global subscriber already set
    let installed = match config.format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Compact => builder.compact().try_init().is_ok(),
        LogFormat::Text => builder.try_init().is_ok(),
    };

    record_installed(installed, filter);
    Ok(())
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    let env_filter = build_filter(log_level);
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .is_ok();

    record_installed(installed, log_level.to_string());
    Ok(())
}

fn build_filter(filter: &str) -> EnvFilter {
    EnvFilter::try_new(filter)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn record_installed(installed: bool, filter: String) {
    if installed {
        let _ = ACTIVE_FILTER.set(filter);
    } else {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_config::LogLevel;

    #[test]
    fn test_repeated_initialisation_is_harmless() {
        let config = LoggingConfig {
            level: LogLevel::Debug,
            format: LogFormat::Compact,
            ..Default::default()
        };
        init_logging_from_config(&config).unwrap();
        init_simple_tracing("warn").unwrap();

        // Only the first successful installation is recorded
        let active = active_filter().unwrap();
        assert!(active == "debug" || active == "warn");
    }

    #[test]
    fn test_invalid_filter_falls_back() {
        let filter = build_filter("not a [valid filter");
        assert!(!filter.to_string().is_empty());
    }
}
