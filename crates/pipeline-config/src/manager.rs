//! Configuration manager
//!
//! Settings are layered: built-in defaults, then an optional TOML, YAML or
//! JSON file, then `FASTPATH_` environment variables. Nested keys use a
//! double underscore in the environment, e.g. `FASTPATH_REMOTE__STORE_ID`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use common::error::{Error, Result};
use config::{Config, Environment, File};
use tracing::debug;

use crate::settings::Settings;

/// Prefix of environment variables read by the manager
pub const ENV_PREFIX: &str = "FASTPATH";

/// Layered configuration
#[derive(Debug, Clone)]
pub struct ConfigManager {
    /// Merged raw configuration
    config: Config,

    /// Typed view of `config`
    settings: Settings,
}

impl ConfigManager {
    /// Loads defaults and the process environment
    pub fn new() -> Result<Self> {
        Self::load(None)
    }

    /// Loads defaults, `file` if given, and the process environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::build(file, None)
    }

    /// Like [`ConfigManager::load`] with an explicit environment
    pub fn load_with_env(file: Option<&Path>, env: HashMap<String, String>) -> Result<Self> {
        Self::build(file, Some(env))
    }

    fn build(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let defaults = Config::try_from(&Settings::default()).map_err(config_error)?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = file {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "configuration file {} does not exist",
                    path.display()
                )));
            }
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config = builder.build().map_err(config_error)?;
        let settings: Settings = config.clone().try_deserialize().map_err(config_error)?;
        Ok(Self { config, settings })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Replaces the typed settings, e.g. after command line overrides
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        self.config.get_string(key).map_err(config_error)
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.config.get_bool(key).map_err(config_error)
    }

    pub fn get_usize(&self, key: &str) -> Result<usize> {
        let value = self.config.get_int(key).map_err(config_error)?;
        usize::try_from(value).map_err(|_| Error::Config(format!("{} must be non-negative, got {}", key, value)))
    }

    pub fn get_path(&self, key: &str) -> Result<PathBuf> {
        self.get_string(key).map(PathBuf::from)
    }

    /// Current settings rendered as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.settings).map_err(|e| Error::Config(e.to_string()))
    }
}

fn config_error(e: config::ConfigError) -> Error {
    Error::Config(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{BuildFailurePolicy, LogFormat};
    use common::types::PipelineVariant;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let manager = ConfigManager::load_with_env(None, HashMap::new()).unwrap();
        let settings = manager.settings();
        assert!(settings.lossy);
        assert!(!settings.serialize);
        assert_eq!(settings.warmup_iterations, 3);
        assert_eq!(settings.max_captured_graphs, 0);
        assert_eq!(settings.on_build_failure, BuildFailurePolicy::Abort);
        assert!(settings.cache_dir.ends_with("fastpath"));
        assert_eq!(manager.get_usize("warmup_iterations").unwrap(), 3);
    }

    #[test]
    fn test_layering_and_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("fastpath.toml");
        std::fs::write(
            &file,
            r#"
cache_dir = "/srv/artifacts"
serialize = true
variant = "kontext"
warmup_iterations = 5
not_a_setting = "ignored"

[remote]
store_id = "org/pipeline"

[log]
format = "json"
"#,
        )
        .unwrap();

        let manager = ConfigManager::load_with_env(
            Some(&file),
            env(&[
                ("FASTPATH_WARMUP_ITERATIONS", "7"),
                ("FASTPATH_ON_BUILD_FAILURE", "skip"),
                ("FASTPATH_REMOTE__BASE_URL", "https://artifacts.example.com"),
                ("UNRELATED_VARIABLE", "1"),
            ]),
        )
        .unwrap();
        let settings = manager.settings();

        assert_eq!(settings.cache_dir, PathBuf::from("/srv/artifacts"));
        assert!(settings.serialize);
        assert!(settings.lossy);
        assert_eq!(settings.variant, PipelineVariant::ImageConditioned);
        assert_eq!(settings.warmup_iterations, 7);
        assert_eq!(settings.on_build_failure, BuildFailurePolicy::Skip);
        assert_eq!(settings.remote.store_id.as_deref(), Some("org/pipeline"));
        assert_eq!(
            settings.remote.base_url.as_deref(),
            Some("https://artifacts.example.com")
        );
        assert_eq!(settings.log.format, LogFormat::Json);
        assert_eq!(settings.log.level, "info");
    }

    #[test]
    fn test_missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigManager::load_with_env(Some(&dir.path().join("none.toml")), HashMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_value_is_a_config_error() {
        let err = ConfigManager::load_with_env(
            None,
            env(&[("FASTPATH_ON_BUILD_FAILURE", "retry")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_render_toml() {
        let manager = ConfigManager::load_with_env(None, HashMap::new()).unwrap();
        let rendered = manager.to_toml().unwrap();
        assert!(rendered.contains("warmup_iterations = 3"));
        assert!(rendered.contains("[log]"));
    }
}
