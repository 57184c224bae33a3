use anyhow::Result;
use async_trait::async_trait;
use bzip2::Compression;
use bzip2::write::BzEncoder;
use distroget::download::{FetchProgress, ProgressCallback};
use distroget::error::{DownloadError, TransferError};
use distroget::transfer::runner::LineCallback;
use distroget::transfer::{CommandOutput, CommandSpec, RemoteCommandRunner};
use distroget::{
    CombinedPipeline, Destination, DownloadManager, DownloadOptions, Fetcher, JobState,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Serves `body` for every URL after failing each one a configured number of times.
struct FlakyFetcher {
    body: Vec<u8>,
    failures: HashMap<String, u32>,
    calls: Mutex<HashMap<String, u32>>,
    delay: Duration,
}

impl FlakyFetcher {
    fn new(body: &[u8]) -> Self {
        Self {
            body: body.to_vec(),
            failures: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
        }
    }

    fn failing(mut self, url: &str, times: u32) -> Self {
        self.failures.insert(url.to_string(), times);
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self, url: &str) -> u32 {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for FlakyFetcher {
    async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressCallback<'_>,
    ) -> Result<u64, DownloadError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(url.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if attempt <= self.failures.get(url).copied().unwrap_or(0) {
            return Err(DownloadError::network(url, "connection reset by peer"));
        }

        tokio::fs::write(dest, &self.body).await?;
        let size = self.body.len() as u64;
        progress(FetchProgress {
            bytes_downloaded: size,
            total_bytes: size,
            speed_bps: 0,
        });
        Ok(size)
    }

    async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        Err(DownloadError::HttpStatus {
            url: url.to_string(),
            status: 404,
        })
    }

    async fn exists(&self, _url: &str) -> bool {
        false
    }
}

/// Accepts every command; records nothing.
struct NoopRunner;

#[async_trait]
impl RemoteCommandRunner for NoopRunner {
    async fn run(&self, _command: &CommandSpec) -> Result<CommandOutput, TransferError> {
        Ok(CommandOutput::ok(""))
    }

    async fn run_streaming(
        &self,
        _command: &CommandSpec,
        _on_line: LineCallback<'_>,
    ) -> Result<CommandOutput, TransferError> {
        Ok(CommandOutput::ok(""))
    }

    fn is_installed(&self, _program: &str) -> bool {
        true
    }
}

fn options(dir: &Path) -> DownloadOptions {
    DownloadOptions {
        target_dir: dir.to_path_buf(),
        verify_checksums: false,
        backoff_base: Duration::from_millis(20),
        ..DownloadOptions::default()
    }
}

async fn run_to_drain(manager: &DownloadManager, urls: &[&str]) {
    manager.start(2);
    for url in urls {
        manager.enqueue(url);
    }
    tokio::time::timeout(Duration::from_secs(10), manager.wait_for_drain())
        .await
        .expect("downloads should drain");
    manager.stop();
}

#[tokio::test]
async fn test_existing_file_is_not_downloaded_again() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("debian.iso"), b"already here")?;

    let fetcher = Arc::new(FlakyFetcher::new(b"new"));
    let mut opts = options(dir.path());
    opts.verify_checksums = true;
    let (manager, _events) = DownloadManager::with_fetcher(opts, fetcher.clone());

    let url = "https://mirror.test/debian.iso";
    run_to_drain(&manager, &[url]).await;

    let snapshot = manager.snapshot();
    assert_eq!(fetcher.calls(url), 0);
    assert_eq!(snapshot.completed, 1);
    assert_eq!(std::fs::read(dir.path().join("debian.iso"))?, b"already here");
    assert_eq!(snapshot.verification.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_retries_are_bounded_with_backoff() -> Result<()> {
    let dir = TempDir::new()?;
    let url = "https://mirror.test/broken.iso";
    let fetcher = Arc::new(FlakyFetcher::new(b"never").failing(url, u32::MAX));
    let (manager, _events) = DownloadManager::with_fetcher(options(dir.path()), fetcher.clone());

    let started = Instant::now();
    run_to_drain(&manager, &[url]).await;
    let elapsed = started.elapsed();

    let snapshot = manager.snapshot();
    let job = snapshot.job(url).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.retry_count, 3);
    assert!(job.last_error.as_deref().unwrap().contains("connection reset"));
    assert_eq!(fetcher.calls(url), 4);
    // 20ms + 40ms + 80ms
    assert!(elapsed >= Duration::from_millis(140), "elapsed {:?}", elapsed);
    assert!(snapshot.downloaded_files.is_empty());
    Ok(())
}

fn bzip2_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[tokio::test]
async fn test_failed_verification_is_not_expanded() -> Result<()> {
    let dir = TempDir::new()?;
    let compressed = bzip2_bytes(b"raw disk image")?;
    let fetcher = Arc::new(FlakyFetcher::new(&compressed));
    let (manager, _events) = DownloadManager::with_fetcher(options(dir.path()), fetcher);

    manager.start(1);
    manager.enqueue_with_digest("https://mirror.test/disk.img.bz2", &"0".repeat(64));
    manager.wait_for_drain().await;
    manager.stop();

    let archive = dir.path().join("disk.img.bz2");
    assert!(archive.exists());
    assert!(!dir.path().join("disk.img").exists());
    assert_eq!(manager.failed_verifications(), vec![archive.clone()]);

    let deleted = manager.delete_failed_verifications();
    assert_eq!(deleted, vec![archive.clone()]);
    assert!(!archive.exists());
    assert!(manager.snapshot().downloaded_files.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_verified_archive_is_expanded() -> Result<()> {
    let dir = TempDir::new()?;
    let compressed = bzip2_bytes(b"raw disk image")?;
    let digest = sha256_hex(&compressed);
    let fetcher = Arc::new(FlakyFetcher::new(&compressed));
    let (manager, _events) = DownloadManager::with_fetcher(options(dir.path()), fetcher);

    manager.start(1);
    manager.enqueue_with_digest("https://mirror.test/disk.img.bz2", &digest);
    manager.wait_for_drain().await;
    manager.stop();

    let expanded = dir.path().join("disk.img");
    assert_eq!(std::fs::read(&expanded)?, b"raw disk image");

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.downloaded_files, vec![expanded]);
    assert!(snapshot.verification.values().all(|r| r.is_verified()));
    assert!(manager.failed_verifications().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_snapshot_counts_stay_consistent() -> Result<()> {
    let dir = TempDir::new()?;
    let fetcher = Arc::new(
        FlakyFetcher::new(b"data")
            .failing("https://mirror.test/f3.iso", 1)
            .slow(Duration::from_millis(5)),
    );
    let (manager, _events) = DownloadManager::with_fetcher(options(dir.path()), fetcher);
    let manager = Arc::new(manager);
    manager.start(3);

    let mut producers = Vec::new();
    for p in 0..4 {
        let manager = Arc::clone(&manager);
        producers.push(tokio::spawn(async move {
            for i in 0..5 {
                manager.enqueue(&format!("https://mirror.test/f{}.iso", p * 5 + i));
                tokio::task::yield_now().await;
            }
        }));
    }

    loop {
        let s = manager.snapshot();
        assert_eq!(
            s.queued + s.active + s.retrying + s.completed + s.failed,
            s.submitted
        );
        assert_eq!(s.active_jobs.len(), s.active);
        if s.submitted == 20 && s.is_drained() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    for producer in producers {
        producer.await?;
    }
    manager.stop();

    let s = manager.snapshot();
    assert_eq!(s.completed, 20);
    assert_eq!(s.retry_counts.get("https://mirror.test/f3.iso"), Some(&1));
    Ok(())
}

#[tokio::test]
async fn test_local_pipeline_mixed_outcomes() -> Result<()> {
    let dir = TempDir::new()?;
    let (a, b, c) = (
        "https://mirror.test/a.iso",
        "https://mirror.test/b.iso",
        "https://mirror.test/c.iso",
    );
    let fetcher = Arc::new(
        FlakyFetcher::new(b"payload")
            .failing(b, 2)
            .failing(c, 4),
    );
    let (pipeline, _events) = CombinedPipeline::open_with_fetcher(
        options(dir.path()),
        Destination::Local(dir.path().to_path_buf()),
        Arc::new(NoopRunner),
        fetcher.clone(),
    )?;

    pipeline.start(3);
    for url in [a, b, c] {
        assert!(pipeline.enqueue(url));
    }
    let results = pipeline.wait_and_deploy(&|_, _| {}).await?;

    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.downloads.completed, 2);
    assert_eq!(snapshot.downloads.failed, 1);
    assert!(snapshot.downloads.has_failures());
    assert_eq!(snapshot.downloads.retry_counts[a], 0);
    assert_eq!(snapshot.downloads.retry_counts[b], 2);
    assert_eq!(snapshot.downloads.retry_counts[c], 3);
    assert_eq!(fetcher.calls(c), 4);

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.success));
    assert!(!snapshot.is_remote);

    let json = serde_json::to_value(&snapshot)?;
    assert_eq!(json["completed"], 2);
    assert_eq!(json["failed"], 1);
    Ok(())
}
