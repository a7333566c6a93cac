//! Local artifact directory

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::error::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::remote::RemoteStore;

/// File extension of packaged artifacts
pub const ARTIFACT_EXTENSION: &str = "pkg";

/// Where an artifact returned by [`ArtifactStore::ensure_local`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactSource {
    /// Already present in the cache directory
    Local,
    /// Fetched from the remote store
    Fetched,
}

/// Artifact present in the cache directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredArtifact {
    /// Stage name
    pub stage: String,

    /// Absolute path
    pub path: PathBuf,

    /// Size in bytes
    pub size_bytes: u64,

    /// Last modification time
    pub modified: Option<DateTime<Utc>>,
}

/// Remote binding of a store
struct RemoteBinding {
    store_id: String,
    remote: Arc<dyn RemoteStore>,
}

/// Directory holding one packaged artifact per stage
pub struct ArtifactStore {
    /// Cache directory
    root: PathBuf,

    /// Remote fallback for absent artifacts
    remote: Option<RemoteBinding>,

    /// Serializes fetches of the same file
    fetch_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ArtifactStore {
    /// Opens the store at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        debug!("Opened artifact store at {}", root.display());
        Ok(Self {
            root,
            remote: None,
            fetch_locks: DashMap::new(),
        })
    }

    /// Fetches absent artifacts from `remote` under `store_id`
    pub fn with_remote(mut self, store_id: impl Into<String>, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(RemoteBinding {
            store_id: store_id.into(),
            remote,
        });
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// File name of a stage's artifact
    pub fn file_name(stage: &str) -> String {
        format!("exported_{}.{}", stage, ARTIFACT_EXTENSION)
    }

    /// Stable path of a stage's artifact
    pub fn path_for(&self, stage: &str) -> PathBuf {
        self.root.join(Self::file_name(stage))
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.path_for(stage).is_file()
    }

    /// Makes sure the stage's artifact is present locally
    ///
    /// A local artifact always wins. Otherwise it is fetched from the remote
    /// store; with no remote configured the artifact is reported missing.
    pub async fn ensure_local(&self, stage: &str) -> Result<(PathBuf, ArtifactSource)> {
        let path = self.path_for(stage);
        if path.is_file() {
            return Ok((path, ArtifactSource::Local));
        }

        let binding = self
            .remote
            .as_ref()
            .ok_or_else(|| Error::ArtifactNotFound { path: path.clone() })?;

        let filename = Self::file_name(stage);
        let lock = self
            .fetch_locks
            .entry(filename.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have fetched it while we waited
        if path.is_file() {
            return Ok((path, ArtifactSource::Local));
        }

        info!(
            "Artifact {} missing locally, fetching from {} ({})",
            filename,
            binding.remote.describe(),
            binding.store_id
        );
        binding
            .remote
            .fetch(&binding.store_id, &filename, &path)
            .await
            .map_err(|e| match e {
                Error::NotFound(_) => Error::ArtifactNotFound { path: path.clone() },
                other => other,
            })?;
        Ok((path, ArtifactSource::Fetched))
    }

    /// Lists the artifacts in the cache directory
    pub fn list(&self) -> Result<Vec<StoredArtifact>> {
        let mut artifacts = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            let stage = match path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("exported_"))
                .and_then(|n| n.strip_suffix(".pkg"))
            {
                Some(stage) => stage.to_string(),
                None => continue,
            };
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            artifacts.push(StoredArtifact {
                stage,
                size_bytes: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                path,
            });
        }
        artifacts.sort_by(|a, b| a.stage.cmp(&b.stage));
        Ok(artifacts)
    }

    /// Removes a stage's artifact, returning whether one existed
    pub fn remove(&self, stage: &str) -> Result<bool> {
        match std::fs::remove_file(self.path_for(stage)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::remote::DirectoryRemoteStore;
    use async_trait::async_trait;

    struct CountingRemote {
        inner: DirectoryRemoteStore,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStore for CountingRemote {
        fn describe(&self) -> String {
            self.inner.describe()
        }

        async fn fetch(&self, store_id: &str, filename: &str, dest: &Path) -> Result<u64> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(store_id, filename, dest).await
        }
    }

    fn mirror_with(stage: &str, contents: &[u8]) -> tempfile::TempDir {
        let mirror = tempfile::tempdir().unwrap();
        let dir = mirror.path().join("org").join("pipeline");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(ArtifactStore::file_name(stage)), contents).unwrap();
        mirror
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("cache");
        let store = ArtifactStore::open(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(
            store.path_for("decoder"),
            root.join("exported_decoder.pkg")
        );
        assert!(!store.contains("decoder"));
    }

    #[tokio::test]
    async fn test_local_artifact_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = mirror_with("transformer", b"remote");
        let remote = Arc::new(CountingRemote {
            inner: DirectoryRemoteStore::new(mirror.path()),
            fetches: AtomicUsize::new(0),
        });
        let store = ArtifactStore::open(dir.path())
            .unwrap()
            .with_remote("org/pipeline", remote.clone());

        std::fs::write(store.path_for("transformer"), b"local").unwrap();
        let (path, source) = store.ensure_local("transformer").await.unwrap();

        assert_eq!(source, ArtifactSource::Local);
        assert_eq!(std::fs::read(path).unwrap(), b"local");
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_fetched_once() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = mirror_with("decoder", b"remote");
        let remote = Arc::new(CountingRemote {
            inner: DirectoryRemoteStore::new(mirror.path()),
            fetches: AtomicUsize::new(0),
        });
        let store = ArtifactStore::open(dir.path())
            .unwrap()
            .with_remote("org/pipeline", remote.clone());

        let (path, source) = store.ensure_local("decoder").await.unwrap();
        assert_eq!(source, ArtifactSource::Fetched);
        assert_eq!(std::fs::read(&path).unwrap(), b"remote");

        let (_, source) = store.ensure_local("decoder").await.unwrap();
        assert_eq!(source, ArtifactSource::Local);
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 1);

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].stage, "decoder");
        assert_eq!(listed[0].size_bytes, 6);

        assert!(store.remove("decoder").unwrap());
        assert!(!store.remove("decoder").unwrap());
    }

    #[tokio::test]
    async fn test_missing_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();

        let offline = ArtifactStore::open(dir.path()).unwrap();
        assert!(offline
            .ensure_local("transformer")
            .await
            .unwrap_err()
            .is_artifact_not_found());

        let store = ArtifactStore::open(dir.path())
            .unwrap()
            .with_remote("org/pipeline", Arc::new(DirectoryRemoteStore::new(mirror.path())));
        let err = store.ensure_local("transformer").await.unwrap_err();
        assert!(err.is_artifact_not_found());
        assert!(!store.contains("transformer"));
    }
}
