//! Artifact provisioning
//!
//! Builds stage artifacts into the cache directory, finds existing ones
//! (fetching from the remote store when absent) and loads them onto the
//! device.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use artifact_store::{ArtifactSource, ArtifactStore, DirectoryRemoteStore, HttpRemoteStore, RemoteStore};
use common::error::{Error, Result};
use compiler::{AotCompiler, CompileOptions, Computation, LoadedExecutable, Loader};
use device_runtime::{CallArgs, Device};
use pipeline_config::RemoteSettings;

/// Base URL used when a store id is configured without one
pub const DEFAULT_REMOTE_BASE_URL: &str = "https://huggingface.co";

/// Remote store described by `settings`, if a store id is configured
///
/// `http(s)://` URLs select the HTTP store; `file://` URLs and plain paths
/// select a mirror directory.
pub fn remote_from_settings(settings: &RemoteSettings) -> Result<Option<(String, Arc<dyn RemoteStore>)>> {
    let Some(store_id) = &settings.store_id else {
        return Ok(None);
    };
    let base_url = settings
        .base_url
        .as_deref()
        .unwrap_or(DEFAULT_REMOTE_BASE_URL);

    let remote: Arc<dyn RemoteStore> = if base_url.starts_with("http://") || base_url.starts_with("https://") {
        Arc::new(HttpRemoteStore::new(base_url)?)
    } else {
        let root = base_url.strip_prefix("file://").unwrap_or(base_url);
        Arc::new(DirectoryRemoteStore::new(root))
    };
    info!("Using remote store {} for {}", remote.describe(), store_id);
    Ok(Some((store_id.clone(), remote)))
}

/// Builds, locates and loads stage artifacts
pub struct ArtifactCoordinator {
    device: Arc<Device>,
    store: ArtifactStore,
    compile: CompileOptions,
}

impl ArtifactCoordinator {
    pub fn new(device: Arc<Device>, store: ArtifactStore, compile: CompileOptions) -> Self {
        Self {
            device,
            store,
            compile,
        }
    }

    pub fn with_remote(mut self, store_id: impl Into<String>, remote: Arc<dyn RemoteStore>) -> Self {
        self.store = self.store.with_remote(store_id, remote);
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Exports and compiles `computation` to the stage's artifact path
    pub async fn build(
        &self,
        stage: &str,
        computation: Arc<dyn Computation>,
        example_args: CallArgs,
    ) -> Result<PathBuf> {
        let path = self.store.path_for(stage);
        let compiler = AotCompiler::new(self.device.clone(), self.compile.clone());
        debug!("Building {} into {}", stage, path.display());

        let artifact = tokio::task::spawn_blocking(move || {
            compiler.export_and_compile(computation.as_ref(), &example_args, &path)
        })
        .await
        .map_err(|e| Error::Internal(format!("build of {} did not complete: {}", stage, e)))??;

        info!(
            "Built {} ({} instructions)",
            artifact.path.display(),
            artifact.manifest.instructions
        );
        Ok(artifact.path)
    }

    /// Path of an existing artifact for `stage`, fetching it if absent
    pub async fn locate(&self, stage: &str) -> Result<(PathBuf, ArtifactSource)> {
        self.store.ensure_local(stage).await
    }

    pub fn load(&self, path: &Path) -> Result<Arc<LoadedExecutable>> {
        Ok(Arc::new(Loader::new(self.device.clone()).load(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_selection() {
        assert!(remote_from_settings(&RemoteSettings::default()).unwrap().is_none());

        let (store_id, remote) = remote_from_settings(&RemoteSettings {
            store_id: Some("org/pipeline".to_string()),
            base_url: Some("file:///srv/mirror".to_string()),
        })
        .unwrap()
        .unwrap();
        assert_eq!(store_id, "org/pipeline");
        assert!(remote.describe().contains("/srv/mirror"));

        let (_, remote) = remote_from_settings(&RemoteSettings {
            store_id: Some("org/pipeline".to_string()),
            base_url: None,
        })
        .unwrap()
        .unwrap();
        assert!(remote.describe().contains("huggingface.co"));
    }
}
