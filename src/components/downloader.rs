//! Per-source download workers: move rows from "metadata known" to
//! "binary downloaded, converted, path committed".
//!
//! Downloads resume through a `.downloading` append file and a byte-range
//! request; a 200 means the server ignored the range and the file restarts
//! from scratch, a 206 appends. The finished temp file is converted and the
//! relative sharded path committed to the store, which is what marks the
//! row done.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use reqwest::header::RANGE;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::application::{Application, Component, RegistryError, ServiceHandle};
use crate::components::convert::{self, ImageConvert};
use crate::components::database::{self, Database};
use crate::components::worker_pool::WorkerPool;
use crate::domain::ImageMeta;
use crate::infrastructure::config::ImageDownloaderConfig;
use crate::infrastructure::http;

pub const COMPONENT_ID: &str = "image-downloader";
pub const SERVICE_ID: &str = "image-downloader";

const FETCH_BATCH_SIZE: i64 = 10;
const FETCH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,
    #[error("download {url} failed after {attempts} attempts: {last}")]
    Exhausted { url: String, attempts: u32, last: String },
    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transfer from {url} aborted: {message}")]
    Transfer { url: String, message: String },
    #[error(transparent)]
    Db(#[from] database::DbError),
    #[error("convert failed: {0}")]
    Convert(#[source] anyhow::Error),
}

pub struct ImageDownloader {
    pool: WorkerPool,
    temp_dir: OnceCell<PathBuf>,
    image_dir: OnceCell<PathBuf>,
    db: OnceCell<Arc<Database>>,
    converter: OnceCell<Arc<ImageConvert>>,
}

impl ImageDownloader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pool: WorkerPool::new(),
            temp_dir: OnceCell::new(),
            image_dir: OnceCell::new(),
            db: OnceCell::new(),
            converter: OnceCell::new(),
        })
    }

    /// Start the long-running worker for one source. Called by the crawl
    /// engine once per configured source.
    pub fn add_source(self: &Arc<Self>, source: String, config: ImageDownloaderConfig) {
        let this = self.clone();
        self.pool.spawn(async move {
            this.run_source(source, config).await;
        });
    }

    async fn run_source(self: Arc<Self>, source: String, config: ImageDownloaderConfig) {
        info!(source, "download worker started");
        let stop = self.pool.stop_token();
        let (Some(db), Some(temp_dir)) = (self.db.get(), self.temp_dir.get()) else {
            error!(source, "download worker started before load finished");
            return;
        };
        loop {
            let batch = match db.get_meta_without_local_path(&source, FETCH_BATCH_SIZE).await {
                Ok(batch) => batch,
                Err(err) => {
                    error!(source, error = %err, "batch query failed");
                    if !self.pool.idle(FETCH_INTERVAL).await {
                        break;
                    }
                    continue;
                }
            };
            if batch.is_empty() {
                debug!(source, "no undownloaded rows, checking again later");
                if !self.pool.idle(FETCH_INTERVAL).await {
                    break;
                }
                continue;
            }
            let client = match http::build_client(config.connect_timeout) {
                Ok(client) => client,
                Err(err) => {
                    error!(source, error = %err, "building download client failed");
                    if !self.pool.idle(FETCH_INTERVAL).await {
                        break;
                    }
                    continue;
                }
            };
            for meta in batch {
                if stop.is_cancelled() {
                    info!(source, "download worker stopping");
                    return;
                }
                match self.download_one(&client, temp_dir, &meta, &config, &stop).await {
                    Ok(()) => {}
                    Err(DownloadError::Cancelled) => {
                        info!(source, "download worker stopping");
                        return;
                    }
                    Err(err) => {
                        // Row stays path-less and is retried with the next batch.
                        warn!(source, id = %meta.id, error = %err, "download failed");
                    }
                }
            }
        }
        info!(source, "download worker stopped");
    }

    async fn download_one(
        &self,
        client: &Client,
        temp_dir: &Path,
        meta: &ImageMeta,
        config: &ImageDownloaderConfig,
        stop: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let (Some(db), Some(image_dir), Some(converter)) =
            (self.db.get(), self.image_dir.get(), self.converter.get())
        else {
            return Err(DownloadError::Cancelled);
        };
        let hash = meta.hash();
        let ext = url_extension(&meta.image_url);
        let temp_path = temp_dir.join(format!("{hash}{ext}"));
        let downloading_path = temp_dir.join(format!("{hash}{ext}.downloading"));
        let output_rel = format!("{}/{hash}.{}", ImageMeta::shard_dir(&hash), converter.extension());
        let output_abs = image_dir.join(&output_rel);

        if !tokio::fs::try_exists(&output_abs).await.unwrap_or(false) {
            if !tokio::fs::try_exists(&temp_path).await.unwrap_or(false) {
                fetch_binary(
                    client,
                    &meta.image_url,
                    &config.headers,
                    &downloading_path,
                    http::RetryPolicy::new(config.error_retry_interval, config.error_retry_max_count),
                    stop,
                )
                .await?;
                tokio::fs::rename(&downloading_path, &temp_path)
                    .await
                    .map_err(|source| DownloadError::Write { path: temp_path.clone(), source })?;
                debug!(id = %meta.id, "download finished, converting");
            }
            converter
                .convert(&temp_path, &output_abs)
                .await
                .map_err(DownloadError::Convert)?;
        }

        let mut committed = meta.clone();
        committed.local_path = Some(output_rel);
        db.update_local_path(&committed).await?;
        tokio::fs::remove_file(&temp_path).await.ok();
        debug!(id = %meta.id, path = ?committed.local_path, "local path committed");
        Ok(())
    }
}

/// Stream `url` into `downloading_path`, resuming from its current length.
/// Transport errors and unexpected statuses discard the partial file and
/// retry on a fixed interval; a mid-body failure aborts and leaves the
/// partial file for the next attempt to resume.
async fn fetch_binary(
    client: &Client,
    url: &str,
    headers: &HashMap<String, String>,
    downloading_path: &Path,
    policy: http::RetryPolicy,
    stop: &CancellationToken,
) -> Result<(), DownloadError> {
    let mut offset = match tokio::fs::metadata(downloading_path).await {
        Ok(stat) => stat.len(),
        Err(_) => 0,
    };
    if offset > 0 {
        info!(url, offset, "resuming partial download");
    }
    let mut last = String::from("no attempt made");
    for _attempt in 0..policy.max_attempts {
        if stop.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let mut request = client.get(url);
        for (key, value) in headers {
            request = request.header(key, value);
        }
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = match request.send().await {
            Ok(response) if matches!(response.status().as_u16(), 200 | 206) => response,
            Ok(response) => {
                last = format!("status {}", response.status());
                discard_partial(downloading_path, &mut offset).await;
                if !sleep_or_stop(policy.interval, stop).await {
                    return Err(DownloadError::Cancelled);
                }
                continue;
            }
            Err(err) => {
                last = err.to_string();
                discard_partial(downloading_path, &mut offset).await;
                if !sleep_or_stop(policy.interval, stop).await {
                    return Err(DownloadError::Cancelled);
                }
                continue;
            }
        };
        // 206 honors our offset; 200 means the range was ignored and the
        // body is the whole object again.
        let resume = response.status().as_u16() == 206;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(resume)
            .truncate(!resume)
            .open(downloading_path)
            .await
            .map_err(|source| DownloadError::Write {
                path: downloading_path.to_path_buf(),
                source,
            })?;
        let mut response = response;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    file.write_all(&chunk).await.map_err(|source| DownloadError::Write {
                        path: downloading_path.to_path_buf(),
                        source,
                    })?;
                }
                Ok(None) => {
                    file.flush().await.map_err(|source| DownloadError::Write {
                        path: downloading_path.to_path_buf(),
                        source,
                    })?;
                    return Ok(());
                }
                Err(err) => {
                    return Err(DownloadError::Transfer {
                        url: url.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }
    Err(DownloadError::Exhausted {
        url: url.to_string(),
        attempts: policy.max_attempts,
        last,
    })
}

async fn discard_partial(downloading_path: &Path, offset: &mut u64) {
    tokio::fs::remove_file(downloading_path).await.ok();
    *offset = 0;
}

async fn sleep_or_stop(interval: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}

/// Extension of the asset URL's path, dot included; empty when there is none.
fn url_extension(url: &str) -> String {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    match Path::new(&path).extension() {
        Some(ext) => format!(".{}", ext.to_string_lossy()),
        None => String::new(),
    }
}

#[async_trait]
impl Component for ImageDownloader {
    fn id(&self) -> &'static str {
        COMPONENT_ID
    }

    fn name(&self) -> &'static str {
        "image downloader"
    }

    async fn load(self: Arc<Self>, app: &Arc<Application>) -> anyhow::Result<()> {
        let temp_dir = app.config().work_dir.join("download_tmp");
        tokio::fs::create_dir_all(&temp_dir).await?;
        self.temp_dir
            .set(temp_dir)
            .map_err(|_| anyhow::anyhow!("image downloader already loaded"))?;
        let _ = self.image_dir.set(app.config().image_dir.clone());

        let db = app
            .get_service(COMPONENT_ID, database::COMPONENT_ID, database::SERVICE_ID)
            .await?
            .downcast::<Database>()
            .map_err(|_| anyhow::anyhow!("unexpected db service type"))?;
        let _ = self.db.set(db);
        let converter = app
            .get_service(COMPONENT_ID, convert::COMPONENT_ID, convert::SERVICE_ID)
            .await?
            .downcast::<ImageConvert>()
            .map_err(|_| anyhow::anyhow!("unexpected converter service type"))?;
        let _ = self.converter.set(converter);
        Ok(())
    }

    async fn unload(self: Arc<Self>) {
        self.pool.drain().await;
    }

    fn service(self: Arc<Self>, service_id: &str) -> Result<ServiceHandle, RegistryError> {
        if service_id == SERVICE_ID {
            Ok(self)
        } else {
            Err(RegistryError::UnknownService {
                component: COMPONENT_ID.to_string(),
                service: service_id.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn extension_comes_from_url_path() {
        assert_eq!(url_extension("https://cdn.example/a/b/pic.png"), ".png");
        assert_eq!(url_extension("https://cdn.example/a/pic.jpeg?sig=abc"), ".jpeg");
        assert_eq!(url_extension("https://cdn.example/a/noext"), "");
    }

    #[tokio::test]
    async fn fresh_download_writes_whole_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/x.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh bytes".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloading = dir.path().join("h.png.downloading");
        let client = http::build_client(5).unwrap();
        fetch_binary(
            &client,
            &format!("{}/x.png", server.uri()),
            &HashMap::new(),
            &downloading,
            http::RetryPolicy::new(0, 3),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(&downloading).unwrap(), b"fresh bytes");
    }

    #[tokio::test]
    async fn resume_sends_range_and_appends_on_206() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/x.png"))
            .and(header("Range", "bytes=5-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b" world".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloading = dir.path().join("h.png.downloading");
        std::fs::write(&downloading, b"hello").unwrap();
        let client = http::build_client(5).unwrap();
        fetch_binary(
            &client,
            &format!("{}/x.png", server.uri()),
            &HashMap::new(),
            &downloading,
            http::RetryPolicy::new(0, 3),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(&downloading).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn range_ignored_with_200_truncates_partial() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/x.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"whole body".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloading = dir.path().join("h.png.downloading");
        std::fs::write(&downloading, b"stale partial").unwrap();
        let client = http::build_client(5).unwrap();
        fetch_binary(
            &client,
            &format!("{}/x.png", server.uri()),
            &HashMap::new(),
            &downloading,
            http::RetryPolicy::new(0, 3),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(&downloading).unwrap(), b"whole body");
    }

    #[tokio::test]
    async fn error_status_discards_partial_then_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/x.png"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/x.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"second try".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloading = dir.path().join("h.png.downloading");
        std::fs::write(&downloading, b"partial").unwrap();
        let client = http::build_client(5).unwrap();
        fetch_binary(
            &client,
            &format!("{}/x.png", server.uri()),
            &HashMap::new(),
            &downloading,
            http::RetryPolicy::new(0, 3),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(&downloading).unwrap(), b"second try");
    }

    #[tokio::test]
    async fn exhaustion_surfaces_last_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/x.png"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloading = dir.path().join("h.png.downloading");
        let client = http::build_client(5).unwrap();
        let err = fetch_binary(
            &client,
            &format!("{}/x.png", server.uri()),
            &HashMap::new(),
            &downloading,
            http::RetryPolicy::new(0, 2),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DownloadError::Exhausted { attempts: 2, .. }));
        assert!(!downloading.exists());
    }
}
