use anyhow::{anyhow, Context};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::error::{CoreError, Result};

pub const DEFAULT_FILE_NAME: &str = "model.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Idle,
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub progress: u8,
    pub status: DownloadStatus,
}

/// Fetches model files into the models directory.
///
/// One download runs at a time; its progress stays queryable after it ends.
pub struct Downloader {
    client: Client,
    models_dir: PathBuf,
    progress: AtomicU8,
    status: Mutex<DownloadStatus>,
    running: AtomicBool,
}

impl Downloader {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: Client::new(),
            models_dir: models_dir.into(),
            progress: AtomicU8::new(0),
            status: Mutex::new(DownloadStatus::Idle),
            running: AtomicBool::new(false),
        }
    }

    pub fn progress(&self) -> DownloadProgress {
        DownloadProgress {
            progress: self.progress.load(Ordering::SeqCst),
            status: *self.status.lock(),
        }
    }

    /// Where `url` would be stored. `file_name` overrides the last path
    /// segment of the URL and must be a bare file name.
    pub fn target_path(&self, url: &Url, file_name: Option<&str>) -> Result<PathBuf> {
        let name = match file_name {
            Some(name) => name.to_string(),
            None => url
                .path_segments()
                .and_then(|mut s| s.next_back())
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_FILE_NAME)
                .to_string(),
        };
        let bare = Path::new(&name).file_name().map(|n| n == name.as_str()).unwrap_or(false);
        if !bare || name == "." || name == ".." {
            return Err(CoreError::validation(format!("invalid file name: {}", name)));
        }
        Ok(self.models_dir.join(name))
    }

    pub async fn download<F>(
        &self,
        url: &str,
        file_name: Option<&str>,
        sha256: Option<&str>,
        mut on_progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(u8) + Send,
    {
        let url = Url::parse(url).map_err(|e| CoreError::validation(format!("invalid model URL: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CoreError::validation(format!("unsupported URL scheme: {}", url.scheme())));
        }
        let dest = self.target_path(&url, file_name)?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Download("a download is already in progress".into()));
        }
        let mut active = ActiveDownload {
            downloader: self,
            part: partial_path(&dest),
            settled: false,
        };

        *self.status.lock() = DownloadStatus::Downloading;
        self.progress.store(0, Ordering::SeqCst);
        on_progress(0);
        tracing::info!("Downloading {} to {}", url, dest.display());

        let result = self
            .fetch(&url, &dest, sha256, |p| {
                self.progress.store(p, Ordering::SeqCst);
                on_progress(p);
            })
            .await;

        active.settled = true;
        match result {
            Ok(()) => {
                self.progress.store(100, Ordering::SeqCst);
                *self.status.lock() = DownloadStatus::Completed;
                on_progress(100);
                tracing::info!("Download finished: {}", dest.display());
                Ok(dest)
            }
            Err(e) => {
                *self.status.lock() = DownloadStatus::Failed;
                tracing::warn!("Download of {} failed: {:#}", url, e);
                Err(CoreError::Download(format!("{:#}", e)))
            }
        }
    }

    async fn fetch<F>(&self, url: &Url, dest: &Path, sha256: Option<&str>, mut on_progress: F) -> anyhow::Result<()>
    where
        F: FnMut(u8),
    {
        tokio::fs::create_dir_all(&self.models_dir)
            .await
            .with_context(|| format!("creating {}", self.models_dir.display()))?;

        let part = partial_path(dest);
        let written = self.stream_to(url, &part, &mut on_progress).await;
        let digest = match written {
            Ok(digest) => digest,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e);
            }
        };

        if let Some(expected) = sha256 {
            let expected = expected.trim().trim_start_matches("sha256:").to_ascii_lowercase();
            if digest != expected {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(anyhow!("digest mismatch: expected {}, got {}", expected, digest));
            }
        }

        tokio::fs::rename(&part, dest)
            .await
            .with_context(|| format!("moving download into {}", dest.display()))?;
        Ok(())
    }

    /// Streams the body into `path` and returns its hex SHA-256.
    async fn stream_to<F>(&self, url: &Url, path: &Path, on_progress: &mut F) -> anyhow::Result<String>
    where
        F: FnMut(u8),
    {
        let res = self.client.get(url.clone()).send().await?.error_for_status()?;
        let total = res.content_length().filter(|&n| n > 0);

        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut body = res.bytes_stream();
        let mut completed = 0u64;
        let mut last = 0u8;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("reading response body")?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            completed += chunk.len() as u64;

            if let Some(total) = total {
                // 100 is only reported once the file is in place.
                let pct = ((completed * 100) / total).min(99) as u8;
                if pct != last {
                    last = pct;
                    on_progress(pct);
                }
            }
        }
        file.flush().await?;

        if let Some(total) = total {
            if completed != total {
                return Err(anyhow!("truncated download: {} of {} bytes", completed, total));
            }
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Held for the lifetime of one `download` call. When the call is dropped
/// before it settles, the download is marked failed and its partial file goes.
struct ActiveDownload<'a> {
    downloader: &'a Downloader,
    part: PathBuf,
    settled: bool,
}

impl Drop for ActiveDownload<'_> {
    fn drop(&mut self) {
        if !self.settled {
            *self.downloader.status.lock() = DownloadStatus::Failed;
            let _ = std::fs::remove_file(&self.part);
            tracing::warn!("Download abandoned before it finished");
        }
        self.downloader.running.store(false, Ordering::SeqCst);
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Serves one canned HTTP response and returns the base URL.
    async fn serve_once(status: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{}", addr)
    }

    /// Sends a response head promising more than `body`, then stalls with
    /// the connection open.
    async fn serve_stalled(body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len() * 10);
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(socket);
        });
        format!("http://{}", addr)
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("gemma-dl-{}", uuid::Uuid::new_v4()))
    }

    fn sha256_hex(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    #[tokio::test]
    async fn test_download_with_digest() {
        let body = vec![7u8; 10_000];
        let base = serve_once("200 OK", body.clone()).await;
        let dir = scratch_dir();
        let downloader = Downloader::new(&dir);

        let mut seen = Vec::new();
        let path = downloader
            .download(&format!("{}/weights/model.bin", base), None, Some(&sha256_hex(&body)), |p| seen.push(p))
            .await
            .unwrap();

        assert_eq!(path, dir.join("model.bin"));
        assert_eq!(std::fs::read(&path).unwrap(), body);
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(
            downloader.progress(),
            DownloadProgress { progress: 100, status: DownloadStatus::Completed }
        );
        assert!(!dir.join("model.bin.part").exists());
    }

    #[tokio::test]
    async fn test_digest_mismatch_leaves_nothing_behind() {
        let base = serve_once("200 OK", b"not the model".to_vec()).await;
        let dir = scratch_dir();
        let downloader = Downloader::new(&dir);

        let err = downloader
            .download(&format!("{}/m.gguf", base), None, Some("sha256:00ff"), |_| {})
            .await
            .unwrap_err();

        assert_eq!(err.code(), "DOWNLOAD_ERROR");
        assert_eq!(downloader.progress().status, DownloadStatus::Failed);
        assert!(!dir.join("m.gguf").exists());
        assert!(!dir.join("m.gguf.part").exists());
    }

    #[tokio::test]
    async fn test_abandoned_download_frees_the_downloader() {
        let stalled = serve_stalled(vec![1u8; 512]).await;
        let dir = scratch_dir();
        let downloader = Downloader::new(&dir);

        let url = format!("{}/big.bin", stalled);
        let attempt = tokio::time::timeout(Duration::from_millis(200), downloader.download(&url, None, None, |_| {})).await;
        assert!(attempt.is_err());
        assert_eq!(downloader.progress().status, DownloadStatus::Failed);
        assert!(!dir.join("big.bin.part").exists());
        assert!(!dir.join("big.bin").exists());

        let body = b"weights".to_vec();
        let base = serve_once("200 OK", body.clone()).await;
        let path = downloader
            .download(&format!("{}/model.bin", base), None, None, |_| {})
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), body);
        assert_eq!(downloader.progress().status, DownloadStatus::Completed);
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let base = serve_once("404 Not Found", Vec::new()).await;
        let downloader = Downloader::new(scratch_dir());
        let err = downloader.download(&format!("{}/missing", base), None, None, |_| {}).await.unwrap_err();
        assert_eq!(err.code(), "DOWNLOAD_ERROR");
    }

    #[tokio::test]
    async fn test_rejects_bad_urls_and_names() {
        let downloader = Downloader::new(scratch_dir());
        for url in ["not a url", "file:///etc/passwd"] {
            let err = downloader.download(url, None, None, |_| {}).await.unwrap_err();
            assert_eq!(err.code(), "VALIDATION_ERROR");
        }
        let err = downloader
            .download("https://example.com/m.bin", Some("../escape.bin"), None, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(downloader.progress().status, DownloadStatus::Idle);
    }

    #[test]
    fn test_target_path_defaults() {
        let downloader = Downloader::new("/models");
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(downloader.target_path(&url, None).unwrap(), PathBuf::from("/models/model.bin"));
        assert_eq!(
            downloader.target_path(&url, Some("gemma.gguf")).unwrap(),
            PathBuf::from("/models/gemma.gguf")
        );
    }
}
