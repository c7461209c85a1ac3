//! Tracing subscriber setup.
//!
//! The library logs through `tracing` with structured fields
//! (`entity_id`, `stage`, `activity`, `attempt`); this module installs a
//! subscriber for binaries and deployments that want those logs on
//! stdout. Embedders that already own a subscriber skip it entirely.

use std::env;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Default filter directive when neither the options nor the
/// environment say otherwise.
pub const DEFAULT_FILTER: &str = "atlasflow=info";

/// The global subscriber was already installed.
#[derive(Debug, Error)]
#[error("failed to install tracing subscriber: {message}")]
pub struct TracingInitError {
    message: String,
}

/// Options for [`init_tracing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingOptions {
    /// Filter directives, e.g. `"atlasflow=debug"`.
    pub filter: String,

    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            json: false,
        }
    }
}

impl TracingOptions {
    /// Creates the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter directives.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Toggles JSON output.
    #[must_use]
    pub const fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Reads options from `ATLAS_LOG` (filter directives) and
    /// `ATLAS_LOG_FORMAT` (`json` for JSON lines). Unset variables keep
    /// their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(filter) = env::var("ATLAS_LOG") {
            if !filter.trim().is_empty() {
                options.filter = filter;
            }
        }
        if let Ok(format) = env::var("ATLAS_LOG_FORMAT") {
            options.json = format.trim().eq_ignore_ascii_case("json");
        }
        options
    }
}

/// Installs the global tracing subscriber.
///
/// Fails if a subscriber is already installed, which is the correct
/// outcome when the embedding application set one up first.
pub fn init_tracing(options: &TracingOptions) -> Result<(), TracingInitError> {
    let filter = EnvFilter::new(&options.filter);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if options.json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|source| TracingInitError {
        message: source.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = TracingOptions::default();
        assert_eq!(options.filter, DEFAULT_FILTER);
        assert!(!options.json);
    }

    #[test]
    fn test_builder_overrides() {
        let options = TracingOptions::new()
            .with_filter("atlasflow=trace")
            .with_json(true);
        assert_eq!(options.filter, "atlasflow=trace");
        assert!(options.json);
    }

    #[test]
    fn test_from_env_reads_atlas_vars() {
        env::set_var("ATLAS_LOG", "atlasflow=debug");
        env::set_var("ATLAS_LOG_FORMAT", "JSON");
        let options = TracingOptions::from_env();
        env::remove_var("ATLAS_LOG");
        env::remove_var("ATLAS_LOG_FORMAT");

        assert_eq!(options.filter, "atlasflow=debug");
        assert!(options.json);
    }

    #[test]
    fn test_second_install_fails() {
        let options = TracingOptions::new().with_filter("atlasflow=warn");
        if init_tracing(&options).is_ok() {
            // The process-global subscriber is now ours; installing again
            // must be refused.
            let err = init_tracing(&options).unwrap_err();
            assert!(err.to_string().contains("tracing subscriber"));
        }
    }
}
