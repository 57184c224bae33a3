use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::StorageMappings;
use crate::download::{
    DownloadEngine, DownloadManager, DownloadOptions, DownloadProgress, DownloadSnapshot, Fetcher,
};
use crate::error::TransferError;
use crate::transfer::{
    ContentKind, CredentialSource, ProxmoxTarget, RemoteCommandRunner, TransferManager,
    TransferStatus,
};

/// Where finished downloads end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Local(PathBuf),
    Remote { host: String, path: String },
}

impl Destination {
    /// `host:path` and `user@host:path` are remote; anything else is a local
    /// directory. A colon after the first `/` belongs to a local path.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if let Some((host, path)) = text.split_once(':') {
            let looks_like_host = !host.is_empty()
                && !host.contains('/')
                && !host.contains('\\')
                // Windows drive letter, e.g. C:\isos
                && !(host.len() == 1 && host.chars().all(|c| c.is_ascii_alphabetic()));
            if looks_like_host {
                let path = if path.is_empty() { "." } else { path };
                return Destination::Remote {
                    host: host.to_string(),
                    path: path.to_string(),
                };
            }
        }
        Destination::Local(PathBuf::from(text))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Destination::Remote { .. })
    }
}

/// Outcome of deploying one file.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentResult {
    pub file: PathBuf,
    pub success: bool,
    pub location: Option<String>,
    pub message: String,
}

pub struct ProxmoxDeployment {
    pub target: Arc<ProxmoxTarget>,
    /// Pool chosen by the operator. Overrides the per-kind mappings.
    pub storage: Option<String>,
    pub mappings: StorageMappings,
}

pub enum Deployment {
    Local,
    Scp(TransferManager),
    Proxmox(ProxmoxDeployment),
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    #[serde(flatten)]
    pub downloads: DownloadSnapshot,
    pub is_remote: bool,
    pub transfer: Option<TransferStatus>,
    pub deployments: Vec<DeploymentResult>,
}

/// A download manager plus the deployment step that runs once it drains.
pub struct CombinedPipeline {
    downloads: DownloadManager,
    deployment: Deployment,
    results: Mutex<Vec<DeploymentResult>>,
}

impl CombinedPipeline {
    pub fn new(downloads: DownloadManager, deployment: Deployment) -> Self {
        Self {
            downloads,
            deployment,
            results: Mutex::new(Vec::new()),
        }
    }

    /// Build a pipeline for a parsed destination. Remote destinations download
    /// into the transfer manager's staging directory.
    pub fn open(
        options: DownloadOptions,
        destination: Destination,
        runner: Arc<dyn RemoteCommandRunner>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DownloadProgress>)> {
        let engine = DownloadEngine::new(options.chunk_size, options.request_timeout)?;
        Self::open_with_fetcher(options, destination, runner, Arc::new(engine))
    }

    pub fn open_with_fetcher(
        mut options: DownloadOptions,
        destination: Destination,
        runner: Arc<dyn RemoteCommandRunner>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DownloadProgress>)> {
        let deployment = match destination {
            Destination::Local(dir) => {
                options.target_dir = dir;
                Deployment::Local
            }
            Destination::Remote { host, path } => {
                let transfer = TransferManager::new(runner, host, path)?;
                options.target_dir = transfer.staging_dir().to_path_buf();
                Deployment::Scp(transfer)
            }
        };

        let (downloads, events) = DownloadManager::with_fetcher(options, fetcher);
        Ok((Self::new(downloads, deployment), events))
    }

    /// Download locally into `options.target_dir`, then upload to Proxmox.
    pub fn proxmox(
        options: DownloadOptions,
        deployment: ProxmoxDeployment,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DownloadProgress>)> {
        let (downloads, events) = DownloadManager::new(options)?;
        Ok((Self::new(downloads, Deployment::Proxmox(deployment)), events))
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self.deployment, Deployment::Local)
    }

    /// Settle authentication before any download starts, so a bad password
    /// does not surface only after hours of downloading.
    pub async fn connect(&self, credentials: &dyn CredentialSource) -> Result<(), TransferError> {
        match &self.deployment {
            Deployment::Local => Ok(()),
            Deployment::Scp(transfer) => {
                transfer.connect(credentials).await?;
                transfer.create_remote_directory().await
            }
            Deployment::Proxmox(pve) => pve.target.test_connection().await,
        }
    }

    pub fn start(&self, worker_count: usize) {
        self.downloads.start(worker_count);
    }

    pub fn enqueue(&self, url: &str) -> bool {
        self.downloads.enqueue(url)
    }

    pub fn enqueue_with_digest(&self, url: &str, digest: &str) -> bool {
        self.downloads.enqueue_with_digest(url, digest)
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let downloads = self.downloads.snapshot();
        let transfer = match &self.deployment {
            Deployment::Scp(transfer) => Some(transfer.status()),
            _ => None,
        };

        PipelineSnapshot {
            downloads,
            is_remote: self.is_remote(),
            transfer,
            deployments: self.results().clone(),
        }
    }

    fn results(&self) -> std::sync::MutexGuard<'_, Vec<DeploymentResult>> {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stop(&self) {
        self.downloads.stop();
    }

    /// Wait for every download, stop the workers, then deploy the files.
    /// Files whose checksum did not match are never deployed.
    pub async fn wait_and_deploy(
        &self,
        on_upload: &(dyn Fn(&Path, u8) + Send + Sync),
    ) -> Result<Vec<DeploymentResult>, TransferError> {
        self.downloads.wait_for_drain().await;
        self.downloads.stop();

        let rejected = self.downloads.failed_verifications();
        let files: Vec<PathBuf> = self
            .downloads
            .snapshot()
            .downloaded_files
            .into_iter()
            .filter(|file| {
                let keep = !rejected.contains(file);
                if !keep {
                    warn!("Not deploying {:?}: checksum verification failed", file);
                }
                keep
            })
            .collect();

        let results = match &self.deployment {
            Deployment::Local => files
                .into_iter()
                .map(|file| DeploymentResult {
                    location: Some(file.display().to_string()),
                    file,
                    success: true,
                    message: "kept locally".to_string(),
                })
                .collect(),
            Deployment::Scp(transfer) => {
                transfer.set_files(&files);
                let outcome = transfer.bulk_transfer().await;
                let status = transfer.status();
                let results = files
                    .into_iter()
                    .map(|file| DeploymentResult {
                        location: Some(format!(
                            "{}:{}",
                            status.remote_host,
                            Path::new(&status.remote_dir)
                                .join(file.file_name().unwrap_or_default())
                                .display()
                        )),
                        success: outcome.is_ok(),
                        message: match &outcome {
                            Ok(()) => "transferred".to_string(),
                            Err(e) => e.to_string(),
                        },
                        file,
                    })
                    .collect();
                *self.results() = results;
                outcome?;
                return Ok(self.results().clone());
            }
            Deployment::Proxmox(pve) => self.deploy_to_proxmox(pve, files, on_upload).await,
        };

        *self.results() = results;
        Ok(self.results().clone())
    }

    async fn deploy_to_proxmox(
        &self,
        pve: &ProxmoxDeployment,
        files: Vec<PathBuf>,
        on_upload: &(dyn Fn(&Path, u8) + Send + Sync),
    ) -> Vec<DeploymentResult> {
        let mut results = Vec::with_capacity(files.len());

        for file in files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let kind = ContentKind::detect(&name);
            let preferred = pve.storage.as_deref().or(pve.mappings.for_kind(kind));

            let outcome = match pve.target.select_storage(kind, preferred).await {
                Ok(storage) => {
                    pve.target
                        .upload_file(&file, &storage.name, kind, &|percent: u8| {
                            on_upload(&file, percent)
                        })
                        .await
                }
                Err(e) => Err(e),
            };

            let result = match outcome {
                Ok(volume) => {
                    info!("Deployed {} as {}", name, volume);
                    DeploymentResult {
                        file,
                        success: true,
                        location: Some(volume),
                        message: "uploaded".to_string(),
                    }
                }
                Err(e) => {
                    warn!("Could not deploy {}: {}", name, e);
                    DeploymentResult {
                        file,
                        success: false,
                        location: None,
                        message: e.to_string(),
                    }
                }
            };
            results.push(result);
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::engine::{FetchProgress, ProgressCallback};
    use crate::error::DownloadError;
    use crate::transfer::runner::CommandOutput;
    use crate::transfer::runner::testing::ScriptedRunner;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct StaticFetcher;

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch_to_file(
            &self,
            url: &str,
            dest: &Path,
            progress: ProgressCallback<'_>,
        ) -> Result<u64, DownloadError> {
            tokio::fs::write(dest, url.as_bytes()).await?;
            progress(FetchProgress {
                bytes_downloaded: url.len() as u64,
                total_bytes: url.len() as u64,
                speed_bps: 0,
            });
            Ok(url.len() as u64)
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

    struct NoPasswords;

    #[async_trait]
    impl CredentialSource for NoPasswords {
        async fn password(&self, _destination: &str, _attempt: u32) -> Option<String> {
            None
        }
    }

    fn options() -> DownloadOptions {
        DownloadOptions {
            backoff_base: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_destination_parse() {
        assert_eq!(
            Destination::parse("root@nas:/srv/iso"),
            Destination::Remote {
                host: "root@nas".to_string(),
                path: "/srv/iso".to_string()
            }
        );
        assert_eq!(
            Destination::parse("nas:"),
            Destination::Remote {
                host: "nas".to_string(),
                path: ".".to_string()
            }
        );
        assert_eq!(
            Destination::parse("/tmp/isos"),
            Destination::Local(PathBuf::from("/tmp/isos"))
        );
        assert_eq!(
            Destination::parse("./a:b"),
            Destination::Local(PathBuf::from("./a:b"))
        );
        assert_eq!(
            Destination::parse(r"C:\isos"),
            Destination::Local(PathBuf::from(r"C:\isos"))
        );
        assert!(!Destination::parse("downloads").is_remote());
    }

    #[tokio::test]
    async fn test_local_pipeline() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let runner = Arc::new(ScriptedRunner::new(&[], |_| CommandOutput::ok("")));
        let (pipeline, _events) = CombinedPipeline::open_with_fetcher(
            options(),
            Destination::Local(temp_dir.path().to_path_buf()),
            runner.clone(),
            Arc::new(StaticFetcher),
        )?;

        pipeline.connect(&NoPasswords).await?;
        pipeline.start(2);
        pipeline.enqueue("https://example.com/a.iso");
        pipeline.enqueue("https://example.com/b.iso");
        let results = pipeline.wait_and_deploy(&|_: &Path, _: u8| {}).await?;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        let snapshot = pipeline.snapshot();
        assert!(!snapshot.is_remote);
        assert!(snapshot.transfer.is_none());
        assert_eq!(snapshot.downloads.completed, 2);
        assert!(runner.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_remote_pipeline_stages_then_copies() -> anyhow::Result<()> {
        let runner = Arc::new(ScriptedRunner::new(&["ssh", "scp"], |_| CommandOutput::ok("")));
        let (pipeline, _events) = CombinedPipeline::open_with_fetcher(
            options(),
            Destination::parse("nas:/srv/iso"),
            runner.clone(),
            Arc::new(StaticFetcher),
        )?;
        let staging = pipeline.downloads().options().target_dir.clone();
        assert!(staging
            .file_name()
            .map(|n| n.to_string_lossy().starts_with("distroget_"))
            .unwrap_or(false));

        pipeline.connect(&NoPasswords).await?;
        pipeline.start(1);
        pipeline.enqueue("https://example.com/a.iso");
        pipeline.wait_and_deploy(&|_: &Path, _: u8| {}).await?;

        let snapshot = pipeline.snapshot();
        assert!(snapshot.is_remote);
        assert_eq!(
            snapshot.transfer.map(|t| t.phase),
            Some(crate::transfer::TransferPhase::Completed)
        );
        assert_eq!(snapshot.deployments[0].location.as_deref(), Some("nas:/srv/iso/a.iso"));

        let scp = runner.calls().pop().unwrap();
        assert_eq!(scp.program, "scp");
        assert_eq!(scp.args.last().map(String::as_str), Some("nas:/srv/iso/"));
        assert!(!staging.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_checksum_is_not_deployed() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let runner = Arc::new(ScriptedRunner::new(&[], |_| CommandOutput::ok("")));
        let (pipeline, _events) = CombinedPipeline::open_with_fetcher(
            options(),
            Destination::Local(temp_dir.path().to_path_buf()),
            runner,
            Arc::new(StaticFetcher),
        )?;

        pipeline.start(1);
        pipeline.enqueue_with_digest("https://example.com/bad.iso", &"f".repeat(64));
        pipeline.enqueue("https://example.com/good.iso");
        let results = pipeline.wait_and_deploy(&|_: &Path, _: u8| {}).await?;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file, temp_dir.path().join("good.iso"));
        Ok(())
    }

    #[tokio::test]
    async fn test_polled_snapshot_does_not_stage_rejected_files() -> anyhow::Result<()> {
        let runner = Arc::new(ScriptedRunner::new(&["ssh", "scp"], |_| CommandOutput::ok("")));
        let (pipeline, _events) = CombinedPipeline::open_with_fetcher(
            options(),
            Destination::parse("nas:/srv/iso"),
            runner.clone(),
            Arc::new(StaticFetcher),
        )?;

        pipeline.connect(&NoPasswords).await?;
        pipeline.start(1);
        pipeline.enqueue_with_digest("https://example.com/bad.iso", &"0".repeat(64));
        pipeline.enqueue("https://example.com/good.iso");
        pipeline.downloads().wait_for_drain().await;

        let polled = pipeline.snapshot();
        assert_eq!(polled.downloads.downloaded_files.len(), 2);
        assert!(polled.transfer.map(|t| t.files.is_empty()).unwrap_or(false));

        let results = pipeline.wait_and_deploy(&|_: &Path, _: u8| {}).await?;
        assert_eq!(results.len(), 1);
        assert!(results[0].file.ends_with("good.iso"));

        let scp = runner.calls().pop().unwrap();
        assert_eq!(scp.program, "scp");
        assert!(scp.args.iter().any(|a| a.ends_with("good.iso")));
        assert!(!scp.args.iter().any(|a| a.ends_with("bad.iso")));

        let transfer = pipeline.snapshot().transfer.unwrap();
        assert_eq!(transfer.files.len(), 1);
        Ok(())
    }
}
