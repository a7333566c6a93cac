//! Typed settings

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use common::types::PipelineVariant;
use serde::{Deserialize, Serialize};

/// What to do when building a stage's artifact fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildFailurePolicy {
    /// Return the error
    #[default]
    Abort,
    /// Serve the stage uncompiled
    Skip,
}

impl fmt::Display for BuildFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildFailurePolicy::Abort => write!(f, "abort"),
            BuildFailurePolicy::Skip => write!(f, "skip"),
        }
    }
}

impl FromStr for BuildFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abort" => Ok(BuildFailurePolicy::Abort),
            "skip" => Ok(BuildFailurePolicy::Skip),
            _ => Err(format!("Unknown build failure policy: {}", s)),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Remote artifact store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Repository holding pre-built artifacts
    pub store_id: Option<String>,

    /// Base URL of the store; a `file://` URL or plain path selects a mirror directory
    pub base_url: Option<String>,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Also write logs to this file
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// All settings recognized by Fastpath
///
/// Unknown keys in any source are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding packaged artifacts
    pub cache_dir: PathBuf,

    /// Apply precision reduction before export
    pub lossy: bool,

    /// Build artifacts locally instead of loading existing ones
    pub serialize: bool,

    /// Pipeline variant, which selects example input shapes
    pub variant: PipelineVariant,

    /// Calls through the capture cache after wrapping
    pub warmup_iterations: usize,

    /// Captured graphs kept per stage; 0 keeps every signature
    pub max_captured_graphs: usize,

    /// Stage build failure handling
    pub on_build_failure: BuildFailurePolicy,

    pub remote: RemoteSettings,

    pub log: LogSettings,
}

impl Settings {
    /// `<platform cache dir>/fastpath`, falling back to the temp directory
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("fastpath")
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: Self::default_cache_dir(),
            lossy: true,
            serialize: false,
            variant: PipelineVariant::TextToImage,
            warmup_iterations: 3,
            max_captured_graphs: 0,
            on_build_failure: BuildFailurePolicy::Abort,
            remote: RemoteSettings::default(),
            log: LogSettings::default(),
        }
    }
}
