//! Logging initialisation via tracing-subscriber.
//!
//! Call [`init`] once at startup, after the configured level is known.
//! `log_level` values are either a bare level (`info`) or comma-separated
//! `target=level` directives (`resource_index::tagger=debug,warn`).

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::AppError;

/// Initialise the global tracing subscriber.
///
/// If `prefer_level` is `true`, `level` takes precedence and `RUST_LOG` is only
/// used as a fallback when `level` is invalid. If `prefer_level` is `false`,
/// `RUST_LOG` takes precedence and `level` is the fallback.
pub fn init(level: &str, prefer_level: bool) -> Result<(), AppError> {
    let filter = if prefer_level {
        match parse_filter(level) {
            Ok(filter) => filter,
            Err(level_err) => EnvFilter::try_from_default_env().map_err(|env_err| {
                AppError::Logger(format!("{level_err}; RUST_LOG parse failed: {env_err}"))
            })?,
        }
    } else {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => parse_filter(level)?,
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))?;

    Ok(())
}

/// Build the filter for a `log_level` value.
///
/// Every directive must end in a known level; `EnvFilter` alone would take
/// a typo such as `verbose` for a target name and silently log nothing.
pub fn parse_filter(spec: &str) -> Result<EnvFilter, AppError> {
    let directives: Vec<&str> = spec.split(',').map(str::trim).filter(|d| !d.is_empty()).collect();
    if directives.is_empty() {
        return Err(AppError::Logger("log level must not be empty".into()));
    }
    for directive in directives {
        let level = directive.rsplit_once('=').map_or(directive, |(_, level)| level);
        level
            .parse::<LevelFilter>()
            .map_err(|_| AppError::Logger(format!("unrecognised log level '{level}' in '{spec}'")))?;
    }
    EnvFilter::try_new(spec).map_err(|e| AppError::Logger(format!("invalid log filter '{spec}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_levels_and_directives_parse() {
        for spec in ["error", "warn", "info", "debug", "trace", "resource_index::tagger=debug,warn"] {
            assert!(parse_filter(spec).is_ok(), "expected '{spec}' to be valid");
        }
    }

    #[test]
    fn unknown_levels_are_rejected() {
        assert!(parse_filter("verbose").is_err());
        assert!(parse_filter("resource_index=loud").is_err());
        assert!(parse_filter(" , ").is_err());
    }

    #[test]
    fn init_info_succeeds_or_already_init() {
        // Another test in the same process may have installed a subscriber.
        match init("info", false) {
            Ok(()) => {}
            Err(AppError::Logger(msg)) if msg.contains("set subscriber") => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
