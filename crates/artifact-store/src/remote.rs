//! Remote artifact stores
//!
//! A remote store serves pre-built artifacts keyed by (store id, filename).
//! Fetches always land in a `.download` file next to the destination and are
//! renamed into place once complete, so a failed fetch never leaves a partial
//! artifact behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use common::error::{Error, Result};
use common::utils::format_bytes;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Source of pre-built artifacts
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Human readable location of the store
    fn describe(&self) -> String;

    /// Fetches `filename` from `store_id` into `dest`, returning its size
    async fn fetch(&self, store_id: &str, filename: &str, dest: &Path) -> Result<u64>;
}

/// Temporary path a fetch writes to before the final rename
pub fn download_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".download");
    dest.with_file_name(name)
}

async fn finish_download(partial: &Path, dest: &Path) -> Result<()> {
    tokio::fs::rename(partial, dest).await?;
    Ok(())
}

/// Remote store served over HTTP
///
/// Files are requested from `{base_url}/{store_id}/resolve/main/{filename}`.
pub struct HttpRemoteStore {
    /// HTTP client
    client: Client,

    /// Base URL without a trailing slash
    base_url: String,

    /// Expected sha256 per filename, hex encoded
    checksums: HashMap<String, String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("fastpath/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::ExternalService(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            checksums: HashMap::new(),
        })
    }

    /// Verifies `filename` against a sha256 digest after download
    pub fn with_checksum(mut self, filename: &str, sha256_hex: &str) -> Self {
        self.checksums
            .insert(filename.to_string(), sha256_hex.to_lowercase());
        self
    }

    pub fn url_for(&self, store_id: &str, filename: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.base_url, store_id, filename)
    }

    async fn download(&self, url: &str, filename: &str, partial: &Path) -> Result<u64> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::ExternalService(format!("failed to request {}: {}", url, e)))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("{} does not exist", url)));
        }
        if !resp.status().is_success() {
            return Err(Error::ExternalService(format!(
                "failed to download {}: HTTP {}",
                url,
                resp.status()
            )));
        }

        let total = resp.content_length().unwrap_or(0);
        let expected = self.checksums.get(filename);
        let mut hasher = expected.map(|_| Sha256::new());

        let mut file = tokio::fs::File::create(partial).await?;
        let mut stream = resp.bytes_stream();
        let mut downloaded = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| Error::ExternalService(format!("download of {} interrupted: {}", url, e)))?;
            file.write_all(&chunk).await?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            downloaded += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        if total > 0 && downloaded != total {
            return Err(Error::ExternalService(format!(
                "{} ended after {} of {}",
                url,
                format_bytes(downloaded),
                format_bytes(total)
            )));
        }

        // Verify checksum if one was registered
        if let (Some(hasher), Some(expected)) = (hasher, expected) {
            let actual = hex::encode(hasher.finalize());
            if &actual != expected {
                return Err(Error::ExternalService(format!(
                    "checksum verification failed for {}: expected {}, got {}",
                    filename, expected, actual
                )));
            }
            debug!("Checksum verification passed for {}", filename);
        }

        Ok(downloaded)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn fetch(&self, store_id: &str, filename: &str, dest: &Path) -> Result<u64> {
        let url = self.url_for(store_id, filename);
        info!("Fetching {} from {}", filename, url);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = download_path(dest);

        match self.download(&url, filename, &partial).await {
            Ok(size) => {
                finish_download(&partial, dest).await?;
                info!("Fetched {} ({})", filename, format_bytes(size));
                Ok(size)
            }
            Err(e) => {
                warn!("Fetch of {} failed: {}", filename, e);
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }
}

/// Remote store backed by a mirror directory laid out as `{root}/{store_id}/{filename}`
pub struct DirectoryRemoteStore {
    root: PathBuf,
}

impl DirectoryRemoteStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RemoteStore for DirectoryRemoteStore {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn fetch(&self, store_id: &str, filename: &str, dest: &Path) -> Result<u64> {
        let source = self.root.join(store_id).join(filename);
        if !tokio::fs::try_exists(&source).await? {
            return Err(Error::NotFound(format!("{} does not exist", source.display())));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = download_path(dest);
        match tokio::fs::copy(&source, &partial).await {
            Ok(size) => {
                finish_download(&partial, dest).await?;
                debug!("Copied {} from {}", filename, source.display());
                Ok(size)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves one HTTP response per connection
    async fn serve(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_download_path() {
        assert_eq!(
            download_path(Path::new("/cache/exported_decoder.pkg")),
            PathBuf::from("/cache/exported_decoder.pkg.download")
        );
    }

    #[tokio::test]
    async fn test_http_fetch() {
        let base = serve("200 OK", b"packaged-bytes").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("exported_transformer.pkg");

        let digest = hex::encode(Sha256::digest(b"packaged-bytes"));
        let remote = HttpRemoteStore::new(&base)
            .unwrap()
            .with_checksum("exported_transformer.pkg", &digest);
        let size = remote
            .fetch("org/models", "exported_transformer.pkg", &dest)
            .await
            .unwrap();

        assert_eq!(size, 14);
        assert_eq!(std::fs::read(&dest).unwrap(), b"packaged-bytes");
        assert!(!download_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_http_checksum_mismatch_leaves_nothing() {
        let base = serve("200 OK", b"tampered").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("exported_decoder.pkg");

        let remote = HttpRemoteStore::new(&base)
            .unwrap()
            .with_checksum("exported_decoder.pkg", &"0".repeat(64));
        let err = remote
            .fetch("org/models", "exported_decoder.pkg", &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ExternalService(_)));
        assert!(!dest.exists());
        assert!(!download_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_http_missing_file() {
        let base = serve("404 Not Found", b"").await;
        let dir = tempfile::tempdir().unwrap();
        let remote = HttpRemoteStore::new(&base).unwrap();
        let err = remote
            .fetch("org/models", "missing.pkg", &dir.path().join("missing.pkg"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_directory_fetch() {
        let mirror = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(mirror.path().join("store")).unwrap();
        std::fs::write(mirror.path().join("store").join("a.pkg"), b"abc").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let remote = DirectoryRemoteStore::new(mirror.path());
        let dest = dir.path().join("a.pkg");
        assert_eq!(remote.fetch("store", "a.pkg", &dest).await.unwrap(), 3);
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");

        let err = remote
            .fetch("store", "b.pkg", &dir.path().join("b.pkg"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
