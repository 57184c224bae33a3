use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::DownloadError;

pub const USER_AGENT: &str = concat!("distroget/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const HEAD_TIMEOUT: Duration = Duration::from_secs(5);
const SPEED_WINDOW: Duration = Duration::from_millis(250);

/// Byte counters reported while a transfer is running, whatever the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub speed_bps: u64,
}

pub type ProgressCallback<'a> = &'a (dyn Fn(FetchProgress) + Send + Sync);

/// Network access used by the download manager and the hash verifier.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Stream `url` into `dest`, reporting progress after every chunk.
    /// Returns the final size of `dest`.
    async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressCallback<'_>,
    ) -> Result<u64, DownloadError>;

    /// Fetch a small text document such as a checksum file or directory listing.
    async fn fetch_text(&self, url: &str) -> Result<String, DownloadError>;

    /// Cheap existence check (HEAD).
    async fn exists(&self, url: &str) -> bool;
}

/// HTTP(S) implementation of [`Fetcher`] backed by reqwest.
pub struct DownloadEngine {
    client: Client,
    chunk_size: usize,
    request_timeout: Duration,
}

impl DownloadEngine {
    pub fn new(chunk_size: usize, request_timeout: Duration) -> Result<Self> {
        // No overall timeout: images are several gigabytes. Connect and
        // per-read timeouts bound stalls instead.
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .read_timeout(request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            chunk_size: chunk_size.max(1),
            request_timeout,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

/// Path of the in-progress file for `dest`.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Reduce `candidate` to a single path component that stays inside the
/// directory it is joined onto. `None` for empty, `.` and `..`.
pub fn safe_file_name(candidate: &str) -> Option<String> {
    let last = candidate
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match last {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}

/// Parse the total size out of a `Content-Range: bytes 1024-2047/2048` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl Fetcher for DownloadEngine {
    async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressCallback<'_>,
    ) -> Result<u64, DownloadError> {
        let part_path = partial_path(dest);
        let mut resume_from = match tokio::fs::metadata(&part_path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };

        let response = loop {
            let mut request = self.client.get(url);
            if resume_from > 0 {
                debug!("Resuming {} from byte {}", url, resume_from);
                request = request.header(RANGE, format!("bytes={}-", resume_from));
            }

            let response = request
                .send()
                .await
                .map_err(|e| DownloadError::network(url, e))?;

            // 416 on resume: the part file is either already complete or
            // does not belong to the current remote file.
            if resume_from > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
                let remote_total = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total);

                if remote_total == Some(resume_from) {
                    debug!("{:?} already holds all {} bytes", part_path, resume_from);
                    tokio::fs::rename(&part_path, dest).await?;
                    progress(FetchProgress {
                        bytes_downloaded: resume_from,
                        total_bytes: resume_from,
                        speed_bps: 0,
                    });
                    return Ok(resume_from);
                }

                warn!(
                    "Discarding {:?}: {} bytes but the server reports {:?}",
                    part_path, resume_from, remote_total
                );
                tokio::fs::remove_file(&part_path).await?;
                resume_from = 0;
                continue;
            }

            break response;
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        // A server that ignores Range answers 200 with the whole body.
        let resuming = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
        let total_bytes = if resuming {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .unwrap_or(resume_from + response.content_length().unwrap_or(0))
        } else {
            response.content_length().unwrap_or(0)
        };

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = if resuming {
            OpenOptions::new().append(true).open(&part_path).await?
        } else {
            File::create(&part_path).await?
        };

        let mut downloaded = if resuming { resume_from } else { 0 };
        let mut window_start = Instant::now();
        let mut window_bytes = downloaded;
        let mut speed_bps = 0;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadError::network(url, e))?;

            for piece in chunk.chunks(self.chunk_size) {
                file.write_all(piece).await?;
                downloaded += piece.len() as u64;

                let elapsed = window_start.elapsed();
                if elapsed >= SPEED_WINDOW {
                    speed_bps = ((downloaded - window_bytes) as f64 / elapsed.as_secs_f64()) as u64;
                    window_start = Instant::now();
                    window_bytes = downloaded;
                }

                progress(FetchProgress {
                    bytes_downloaded: downloaded,
                    total_bytes,
                    speed_bps,
                });
            }
        }

        file.flush().await?;
        drop(file);

        tokio::fs::rename(&part_path, dest).await?;
        Ok(downloaded)
    }

    async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;

        if !response.status().is_success() {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        response
            .text()
            .await
            .map_err(|e| DownloadError::network(url, e))
    }

    async fn exists(&self, url: &str) -> bool {
        match self.client.head(url).timeout(HEAD_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("HEAD {} failed: {}", url, e);
                false
            }
        }
    }
}
