//! Logging setup.
//!
//! Everything in this crate logs through [`tracing`]. Nothing is
//! printed until the embedding program installs a subscriber, either
//! its own or the one from [`setup_logging`].
//!
//! The level can come from the caller or from the `TIDEWATER_LOG`
//! environment variable, which takes a full [`EnvFilter`] directive
//! like `tidewater=debug,tidewater::buffer=trace`.

use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::ConfigError;

pub const LOG_ENV_VAR: &str = "TIDEWATER_LOG";

pub(crate) fn get_log_level(level: Option<&str>) -> Result<LevelFilter, ConfigError> {
    if let Some(level) = level {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            level => Err(ConfigError::LogLevel(level.to_owned())),
        }
    } else {
        Ok(LevelFilter::ERROR)
    }
}

/// Install a global compact stdout logger.
///
/// `TIDEWATER_LOG` wins over `log_level` when set. Without either only
/// errors are logged.
pub fn setup_logging(log_level: Option<&str>) -> Result<(), ConfigError> {
    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true)
        // Worker threads are named after their unit and operator
        .with_thread_names(true);

    match std::env::var(LOG_ENV_VAR) {
        Ok(directives) => {
            let filter = EnvFilter::try_new(&directives)
                .map_err(|err| ConfigError::LogLevel(format!("{directives}: {err}")))?;
            set_global_subscriber(Registry::default().with(logs.with_filter(filter)));
        }
        Err(_) => {
            let level = get_log_level(log_level)?;
            set_global_subscriber(
                Registry::default().with(logs.with_filter(Targets::new().with_target("tidewater", level))),
            );
        }
    }
    Ok(())
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if logging was already initialized, which happens
    // in tests and if the embedding program set up its own.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse_case_insensitively() {
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(ConfigError::LogLevel(level)) if level == "loud"
    ));
}
