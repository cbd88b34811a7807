//! Configuration loading: an optional TOML file layered with environment
//! variable overrides, producing an [`OrchestratorConfig`].

use std::time::Duration;
use thiserror::Error;

use crate::orchestrator::OrchestratorConfig;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configured file path could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// The path that could not be read.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file's contents were not valid TOML, or the shape didn't match.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// The path that failed to parse.
        path: String,
        /// The underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}

/// On-disk representation of an [`OrchestratorConfig`]. Every field is
/// optional; absent fields fall back to [`OrchestratorConfig::default`].
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct FileConfig {
    evaluation_timeout_ms: Option<u64>,
    parallel_evaluations: Option<bool>,
    approval_threshold: Option<i64>,
    majority_required: Option<usize>,
    health_check_interval_ms: Option<u64>,
    active_health_probing: Option<bool>,
    milestone_check_interval_ms: Option<u64>,
    max_retries: Option<u32>,
    python_services_url: Option<String>,
    python_api_key: Option<String>,
}

/// Loads configuration from an optional TOML file, then applies the
/// `PYTHON_SERVICES_URL` / `PYTHON_API_KEY` environment overrides on top.
///
/// # Errors
///
/// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] if `path` is
/// given and either reading or parsing it fails. A missing `path` is not an
/// error: the defaults apply.
pub fn load(path: Option<&str>) -> Result<OrchestratorConfig, ConfigError> {
    let file = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?
        }
        None => FileConfig::default(),
    };

    let mut config = OrchestratorConfig::default();
    if let Some(ms) = file.evaluation_timeout_ms {
        config.evaluation_timeout = Duration::from_millis(ms);
    }
    if let Some(parallel) = file.parallel_evaluations {
        config.parallel_evaluations = parallel;
    }
    if let Some(threshold) = file.approval_threshold {
        config.decision.approval_threshold = rust_decimal::Decimal::from(threshold);
    }
    if let Some(majority) = file.majority_required {
        config.decision.majority_required = majority;
    }
    if let Some(ms) = file.health_check_interval_ms {
        config.health_check_interval = Duration::from_millis(ms);
    }
    if let Some(active) = file.active_health_probing {
        config.active_health_probing = active;
    }
    if let Some(ms) = file.milestone_check_interval_ms {
        config.milestone_check_interval = Duration::from_millis(ms);
    }
    if let Some(retries) = file.max_retries {
        config.max_retries = retries;
    }
    config.python_services_url = file.python_services_url;
    config.python_api_key = file.python_api_key;

    if let Ok(url) = std::env::var("PYTHON_SERVICES_URL") {
        config.python_services_url = Some(url);
    }
    if let Ok(key) = std::env::var("PYTHON_API_KEY") {
        config.python_api_key = Some(key);
    }

    Ok(config)
}

impl FileConfig {
    /// Builds the decision-law portion of a [`DecisionConfig`] this file
    /// would override, useful to callers inspecting a parsed file directly.
    #[must_use]
    pub fn decision_overrides(&self) -> (Option<i64>, Option<usize>) {
        (self.approval_threshold, self.majority_required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DecisionConfig;

    #[test]
    fn missing_path_yields_defaults() {
        let config = load(None).unwrap();
        assert_eq!(config.evaluation_timeout, Duration::from_secs(300));
        assert_eq!(config.decision.approval_threshold, DecisionConfig::default().approval_threshold);
    }

    #[test]
    fn parses_a_minimal_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("grant-orchestrator-test-{}.toml", std::process::id()));
        std::fs::write(&path, "evaluation_timeout_ms = 60000\nmax_retries = 5\n").unwrap();
        let config = load(Some(path.to_str().unwrap())).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.evaluation_timeout, Duration::from_millis(60_000));
        assert_eq!(config.max_retries, 5);
    }
}
