use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::archive::ArchiveExpander;
use super::checksum::{HashVerifier, VerificationResult};
use super::engine::{
    DEFAULT_CHUNK_SIZE, DEFAULT_REQUEST_TIMEOUT, DownloadEngine, FetchProgress, Fetcher,
    safe_file_name,
};
use super::progress::{DownloadProgress, percent};
use super::torrent::TorrentDownloader;
use crate::config::Config;
use crate::error::DownloadError;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub target_dir: PathBuf,
    pub max_workers: usize,
    pub verify_checksums: bool,
    pub decompress: bool,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub chunk_size: usize,
    pub request_timeout: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            target_dir: std::env::current_dir().unwrap_or_default(),
            max_workers: 3,
            verify_checksums: true,
            decompress: true,
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl DownloadOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            target_dir: config.general.download_dir.clone(),
            max_workers: config.general.max_workers.max(1),
            verify_checksums: config.general.verify_checksums,
            decompress: config.general.decompress,
            max_retries: config.retry.max_retries,
            backoff_base: Duration::try_from_secs_f64(config.retry.backoff_base_secs)
                .unwrap_or(Duration::from_secs(1)),
            chunk_size: config.retry.chunk_size,
            request_timeout: Duration::from_secs(config.retry.request_timeout_secs),
        }
    }

    /// Delay before re-queueing after the `retry`-th failure (1-based).
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(retry.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Retrying,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_outstanding(self) -> bool {
        matches!(self, JobState::Queued | JobState::Active | JobState::Retrying)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadJob {
    pub url: String,
    pub filename: String,
    pub state: JobState,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub speed_bps: u64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub expected_digest: Option<String>,
    pub local_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadJob {
    fn new(url: &str, expected_digest: Option<String>) -> Self {
        Self {
            url: url.to_string(),
            filename: filename_for_url(url),
            state: JobState::Queued,
            bytes_downloaded: 0,
            total_bytes: 0,
            speed_bps: 0,
            retry_count: 0,
            last_error: None,
            expected_digest,
            local_path: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn progress_percent(&self) -> u8 {
        percent(self.bytes_downloaded, self.total_bytes)
    }
}

/// Name of the local file a URL downloads to.
pub fn filename_for_url(url: &str) -> String {
    if TorrentDownloader::is_torrent_url(url) {
        return TorrentDownloader::output_filename(url);
    }

    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .or_else(|| url.split(['?', '#']).next()?.rsplit('/').next().map(str::to_string))
        .as_deref()
        .and_then(safe_file_name)
        .unwrap_or_else(|| "download".to_string())
}

/// Point-in-time copy of the manager state. Every count is derived from the
/// same lock acquisition, so they always add up to `submitted`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadSnapshot {
    pub submitted: usize,
    pub queued: usize,
    pub active: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub active_jobs: Vec<DownloadJob>,
    pub retry_counts: BTreeMap<String, u32>,
    pub downloaded_files: Vec<PathBuf>,
    pub verification: BTreeMap<String, VerificationResult>,
    pub jobs: Vec<DownloadJob>,
}

impl DownloadSnapshot {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn is_drained(&self) -> bool {
        self.queued == 0 && self.active == 0 && self.retrying == 0
    }

    pub fn job(&self, url: &str) -> Option<&DownloadJob> {
        self.jobs.iter().find(|job| job.url == url)
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    jobs: HashMap<String, DownloadJob>,
    order: Vec<String>,
    downloaded_files: Vec<PathBuf>,
    verification: HashMap<PathBuf, VerificationResult>,
    started: bool,
    stopping: bool,
}

impl State {
    fn count(&self, state: JobState) -> usize {
        self.jobs.values().filter(|job| job.state == state).count()
    }

    fn is_drained(&self) -> bool {
        self.queue.is_empty() && !self.jobs.values().any(|job| job.state.is_outstanding())
    }

    fn job_mut(&mut self, url: &str) -> Option<&mut DownloadJob> {
        self.jobs.get_mut(url)
    }
}

struct Shared {
    options: DownloadOptions,
    fetcher: Arc<dyn Fetcher>,
    verifier: HashVerifier,
    torrent: TorrentDownloader,
    state: Mutex<State>,
    work_ready: Notify,
    drained: Notify,
    events: mpsc::UnboundedSender<DownloadProgress>,
}

/// Bounded worker pool draining a FIFO queue of URLs: fetch, verify, expand.
pub struct DownloadManager {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadManager {
    pub fn new(
        options: DownloadOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DownloadProgress>)> {
        let engine = DownloadEngine::new(options.chunk_size, options.request_timeout)?;
        Ok(Self::with_fetcher(options, Arc::new(engine)))
    }

    pub fn with_fetcher(
        options: DownloadOptions,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<DownloadProgress>) {
        Self::with_parts(options, fetcher, TorrentDownloader::new())
    }

    pub fn with_parts(
        options: DownloadOptions,
        fetcher: Arc<dyn Fetcher>,
        torrent: TorrentDownloader,
    ) -> (Self, mpsc::UnboundedReceiver<DownloadProgress>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            verifier: HashVerifier::new(Arc::clone(&fetcher)),
            options,
            fetcher,
            torrent,
            state: Mutex::new(State::default()),
            work_ready: Notify::new(),
            drained: Notify::new(),
            events,
        });

        (
            Self {
                shared,
                workers: Mutex::new(Vec::new()),
            },
            receiver,
        )
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.shared.options
    }

    /// Spawn `worker_count` workers. Calling it again has no effect, also
    /// after [`stop`](Self::stop): a stopped manager is not restartable.
    pub fn start(&self, worker_count: usize) {
        {
            let mut state = self.shared.lock();
            if state.stopping {
                warn!("Download manager was stopped and cannot be restarted");
                return;
            }
            if state.started {
                debug!("Download workers already running");
                return;
            }
            state.started = true;
        }

        let worker_count = worker_count.max(1);
        info!("Starting {} download workers", worker_count);

        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for id in 0..worker_count {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(async move { shared.worker_loop(id).await }));
        }
    }

    pub fn enqueue(&self, url: &str) -> bool {
        self.shared.enqueue(url, None)
    }

    /// Queue `url` and verify it against `digest` instead of a published checksum.
    pub fn enqueue_with_digest(&self, url: &str, digest: &str) -> bool {
        self.shared.enqueue(url, Some(digest.trim().to_lowercase()))
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        let state = self.shared.lock();

        let jobs: Vec<DownloadJob> = state
            .order
            .iter()
            .filter_map(|url| state.jobs.get(url).cloned())
            .collect();

        DownloadSnapshot {
            submitted: jobs.len(),
            queued: state.count(JobState::Queued),
            active: state.count(JobState::Active),
            retrying: state.count(JobState::Retrying),
            completed: state.count(JobState::Completed),
            failed: state.count(JobState::Failed),
            active_jobs: jobs
                .iter()
                .filter(|job| job.state == JobState::Active)
                .cloned()
                .collect(),
            retry_counts: jobs
                .iter()
                .map(|job| (job.url.clone(), job.retry_count))
                .collect(),
            downloaded_files: state.downloaded_files.clone(),
            verification: state
                .verification
                .iter()
                .map(|(path, result)| (path.display().to_string(), result.clone()))
                .collect(),
            jobs,
        }
    }

    /// Ask workers to exit once their current job is finished.
    pub fn stop(&self) {
        {
            let mut state = self.shared.lock();
            if state.stopping {
                return;
            }
            state.stopping = true;
        }
        info!("Stopping download workers");
        self.shared.work_ready.notify_waiters();
    }

    /// Resolve once nothing is queued, active or waiting to retry.
    pub async fn wait_for_drain(&self) {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.lock().is_drained() {
                return;
            }
            notified.await;
        }
    }

    /// Downloaded files whose checksum did not match.
    pub fn failed_verifications(&self) -> Vec<PathBuf> {
        let state = self.shared.lock();
        let mut failed: Vec<PathBuf> = state
            .verification
            .iter()
            .filter(|(_, result)| result.is_failed())
            .map(|(path, _)| path.clone())
            .collect();
        failed.sort();
        failed
    }

    /// Delete every file whose verification failed and return the paths
    /// removed. Files that are already gone count as removed.
    pub fn delete_failed_verifications(&self) -> Vec<PathBuf> {
        let mut deleted = Vec::new();
        for path in self.failed_verifications() {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!("Deleted {:?} after failed verification", path);
                    deleted.push(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => deleted.push(path),
                Err(e) => warn!("Could not delete {:?}: {}", path, e),
            }
        }

        let mut state = self.shared.lock();
        state.downloaded_files.retain(|path| !deleted.contains(path));
        deleted
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.shared.lock().stopping = true;
        self.shared.work_ready.notify_waiters();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: DownloadProgress) {
        let _ = self.events.send(event);
    }

    fn enqueue(&self, url: &str, digest: Option<String>) -> bool {
        let url = url.trim();
        if url.is_empty() {
            return false;
        }

        {
            let mut state = self.lock();
            match state.job_mut(url) {
                Some(job) if job.state.is_outstanding() => {
                    debug!("{} is already {:?}, not queueing again", url, job.state);
                    return false;
                }
                Some(job) => {
                    let local_path = job.local_path.take();
                    *job = DownloadJob::new(url, digest.or(job.expected_digest.take()));
                    job.local_path = local_path;
                }
                None => {
                    state.jobs.insert(url.to_string(), DownloadJob::new(url, digest));
                    state.order.push(url.to_string());
                }
            }
            state.queue.push_back(url.to_string());
        }

        debug!("Queued {}", url);
        self.work_ready.notify_one();
        true
    }

    async fn next_job(&self) -> Option<String> {
        loop {
            let notified = self.work_ready.notified();
            {
                let mut state = self.lock();
                if state.stopping {
                    return None;
                }
                if let Some(url) = state.queue.pop_front() {
                    if let Some(job) = state.job_mut(&url) {
                        job.state = JobState::Active;
                        job.started_at.get_or_insert_with(Utc::now);
                        job.bytes_downloaded = 0;
                        job.speed_bps = 0;
                    }
                    return Some(url);
                }
            }
            notified.await;
        }
    }

    async fn worker_loop(self: Arc<Self>, id: usize) {
        debug!("Download worker {} started", id);
        while let Some(url) = self.next_job().await {
            self.run_job(&url).await;
        }
        debug!("Download worker {} exiting", id);
    }

    async fn run_job(self: &Arc<Self>, url: &str) {
        let (filename, digest) = {
            let state = self.lock();
            match state.jobs.get(url) {
                Some(job) => (job.filename.clone(), job.expected_digest.clone()),
                None => return,
            }
        };

        let dest = self.options.target_dir.join(&filename);
        self.emit(DownloadProgress::Started {
            url: url.to_string(),
            output_path: dest.clone(),
        });

        match self.fetch(url, &dest).await {
            Ok(path) => {
                let final_path = self.finish_fetched(url, &path, digest.as_deref()).await;
                self.record_completed(url, final_path);
            }
            Err(e) => self.record_failure(url, e),
        }
    }

    async fn fetch(self: &Arc<Self>, url: &str, dest: &Path) -> Result<PathBuf, DownloadError> {
        tokio::fs::create_dir_all(&self.options.target_dir).await?;

        if dest.exists() {
            info!("{:?} already exists, skipping download", dest);
            return Ok(dest.to_path_buf());
        }

        let shared = Arc::clone(self);
        let job_url = url.to_string();
        let on_progress = move |progress: FetchProgress| shared.record_progress(&job_url, progress);

        if TorrentDownloader::is_torrent_url(url) {
            self.torrent
                .download(url, &self.options.target_dir, &on_progress)
                .await
        } else {
            self.fetcher.fetch_to_file(url, dest, &on_progress).await?;
            Ok(dest.to_path_buf())
        }
    }

    fn record_progress(&self, url: &str, progress: FetchProgress) {
        if let Some(job) = self.lock().job_mut(url) {
            job.bytes_downloaded = progress.bytes_downloaded;
            job.total_bytes = progress.total_bytes;
            job.speed_bps = progress.speed_bps;
        }

        self.emit(DownloadProgress::Progress {
            url: url.to_string(),
            bytes_downloaded: progress.bytes_downloaded,
            total_bytes: progress.total_bytes,
            progress_percent: percent(progress.bytes_downloaded, progress.total_bytes),
            speed_bps: progress.speed_bps,
        });
    }

    /// Verify, then expand unless verification failed. Returns the final path.
    async fn finish_fetched(&self, url: &str, path: &Path, digest: Option<&str>) -> PathBuf {
        let mut verification_failed = false;

        if self.options.verify_checksums || digest.is_some() {
            self.emit(DownloadProgress::VerifyingChecksum {
                url: url.to_string(),
            });

            let source_url = (!url.starts_with("magnet:")).then_some(url);
            let result = self.verifier.verify_file(path, digest, source_url).await;
            verification_failed = result.is_failed();

            let event = match &result {
                VerificationResult::Verified { algorithm, .. } => {
                    info!("{} verified {:?}", algorithm, path);
                    DownloadProgress::ChecksumVerified {
                        url: url.to_string(),
                        path: path.to_path_buf(),
                    }
                }
                VerificationResult::Failed { reason, .. } => {
                    warn!("Verification failed for {:?}: {}", path, reason);
                    DownloadProgress::ChecksumFailed {
                        url: url.to_string(),
                        path: path.to_path_buf(),
                        reason: reason.clone(),
                    }
                }
                VerificationResult::Unknown { reason, .. } => {
                    info!("Could not verify {:?}: {}", path, reason);
                    DownloadProgress::ChecksumUnknown {
                        url: url.to_string(),
                        path: path.to_path_buf(),
                        reason: reason.clone(),
                    }
                }
            };

            self.lock().verification.insert(path.to_path_buf(), result);
            self.emit(event);
        }

        if !self.options.decompress || verification_failed || !ArchiveExpander::is_supported(path) {
            return path.to_path_buf();
        }

        match ArchiveExpander::expand(path).await {
            Ok(expanded) => {
                self.emit(DownloadProgress::Decompressed {
                    url: url.to_string(),
                    from: path.to_path_buf(),
                    to: expanded.clone(),
                });
                expanded
            }
            Err(e) => {
                warn!("Could not decompress {:?}, keeping archive: {}", path, e);
                path.to_path_buf()
            }
        }
    }

    fn record_completed(&self, url: &str, final_path: PathBuf) {
        {
            let mut state = self.lock();
            if let Some(job) = state.job_mut(url) {
                job.state = JobState::Completed;
                job.last_error = None;
                job.local_path = Some(final_path.clone());
                job.finished_at = Some(Utc::now());
                if job.total_bytes > 0 {
                    job.bytes_downloaded = job.total_bytes;
                }
            }
            if !state.downloaded_files.contains(&final_path) {
                state.downloaded_files.push(final_path.clone());
            }
        }

        info!("Completed {} -> {:?}", url, final_path);
        self.emit(DownloadProgress::Completed {
            url: url.to_string(),
            path: final_path,
        });
        self.drained.notify_waiters();
    }

    fn record_failure(self: &Arc<Self>, url: &str, err: DownloadError) {
        let message = err.to_string();
        let max_retries = self.options.max_retries;

        let retry = {
            let mut state = self.lock();
            let Some(job) = state.job_mut(url) else {
                return;
            };
            job.last_error = Some(message.clone());

            if err.is_retryable() && job.retry_count < max_retries {
                job.retry_count += 1;
                job.state = JobState::Retrying;
                Some(job.retry_count)
            } else {
                job.state = JobState::Failed;
                job.finished_at = Some(Utc::now());
                None
            }
        };

        match retry {
            Some(attempt) => {
                let delay = self.options.backoff_delay(attempt);
                warn!(
                    "{} failed ({}), retry {}/{} in {:?}",
                    url, message, attempt, max_retries, delay
                );
                self.emit(DownloadProgress::Retry {
                    url: url.to_string(),
                    attempt,
                    max_attempts: max_retries,
                    delay,
                    error: message,
                });

                let shared = Arc::clone(self);
                let url = url.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.requeue(&url);
                });
            }
            None => {
                let attempts = self
                    .lock()
                    .jobs
                    .get(url)
                    .map(|job| job.retry_count + 1)
                    .unwrap_or(1);
                error!("{} failed after {} attempt(s): {}", url, attempts, message);
                self.emit(DownloadProgress::Failed {
                    url: url.to_string(),
                    error: message,
                    attempts,
                });
                self.drained.notify_waiters();
            }
        }
    }

    fn requeue(&self, url: &str) {
        {
            let mut state = self.lock();
            match state.job_mut(url) {
                Some(job) if job.state == JobState::Retrying => job.state = JobState::Queued,
                _ => return,
            }
            state.queue.push_back(url.to_string());
        }
        self.work_ready.notify_one();
    }
}
