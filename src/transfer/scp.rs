use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::runner::{
    CommandSpec, RemoteCommandRunner, SSHPASS_HINT, key_check_command, remote_path_quote, ssh_command,
};
use crate::error::TransferError;

pub const MAX_PASSWORD_ATTEMPTS: u32 = 3;

/// Supplies passwords when key-based login is not set up.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Password for `destination` on the given 1-based attempt, or `None`
    /// when the operator gives up.
    async fn password(&self, destination: &str, attempt: u32) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferPhase {
    Pending,
    Transferring,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferJob {
    pub local_path: PathBuf,
    pub remote_host: String,
    pub remote_dir: String,
    pub phase: TransferPhase,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferStatus {
    pub phase: TransferPhase,
    pub remote_host: String,
    pub remote_dir: String,
    pub staging_dir: PathBuf,
    pub files: Vec<TransferJob>,
    pub error: Option<String>,
    pub recovery_command: Option<String>,
}

#[derive(Clone)]
enum AuthMethod {
    Key,
    Password(String),
}

struct TransferState {
    phase: TransferPhase,
    files: Vec<PathBuf>,
    auth: Option<AuthMethod>,
    error: Option<String>,
    recovery_command: Option<String>,
}

/// Stages downloads locally and copies them to `remote_host:remote_dir`
/// in one `scp` run once every download has finished.
pub struct TransferManager {
    runner: Arc<dyn RemoteCommandRunner>,
    remote_host: String,
    remote_dir: String,
    staging_dir: PathBuf,
    state: Mutex<TransferState>,
}

impl TransferManager {
    pub fn new(
        runner: Arc<dyn RemoteCommandRunner>,
        remote_host: impl Into<String>,
        remote_dir: impl Into<String>,
    ) -> Result<Self, TransferError> {
        // Kept on disk past drop: staged files must survive a failed copy.
        let staging_dir = tempfile::Builder::new()
            .prefix("distroget_")
            .tempdir()?
            .keep();
        debug!("Staging downloads in {:?}", staging_dir);

        Ok(Self {
            runner,
            remote_host: remote_host.into(),
            remote_dir: remote_dir.into(),
            staging_dir,
            state: Mutex::new(TransferState {
                phase: TransferPhase::Pending,
                files: Vec::new(),
                auth: None,
                error: None,
                recovery_command: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TransferState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    /// Replace the batch copied by the next [`bulk_transfer`](Self::bulk_transfer).
    pub fn set_files<I, P>(&self, files: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut batch: Vec<PathBuf> = Vec::new();
        for path in files.into_iter().map(Into::into) {
            if !batch.contains(&path) {
                batch.push(path);
            }
        }
        self.lock().files = batch;
    }

    pub fn status(&self) -> TransferStatus {
        let state = self.lock();
        TransferStatus {
            phase: state.phase,
            remote_host: self.remote_host.clone(),
            remote_dir: self.remote_dir.clone(),
            staging_dir: self.staging_dir.clone(),
            files: state
                .files
                .iter()
                .map(|path| TransferJob {
                    local_path: path.clone(),
                    remote_host: self.remote_host.clone(),
                    remote_dir: self.remote_dir.clone(),
                    phase: state.phase,
                })
                .collect(),
            error: state.error.clone(),
            recovery_command: state.recovery_command.clone(),
        }
    }

    fn password(&self) -> Option<String> {
        match &self.lock().auth {
            Some(AuthMethod::Password(password)) => Some(password.clone()),
            _ => None,
        }
    }

    /// Whether `ssh` logs in without a password.
    pub async fn check_key_auth(&self) -> bool {
        match self.runner.run(&key_check_command(&self.remote_host)).await {
            Ok(output) => output.success(),
            Err(e) => {
                debug!("Key check for {} failed: {}", self.remote_host, e);
                false
            }
        }
    }

    /// Try `password` with a short `sshpass` login.
    pub async fn test_password(&self, password: &str) -> Result<bool, TransferError> {
        if !self.runner.is_installed("sshpass") {
            return Err(TransferError::capability("sshpass", SSHPASS_HINT));
        }

        let spec = ssh_command(&self.remote_host, Some(password), "echo \"SSH OK\"")
            .timeout(Duration::from_secs(10));
        match self.runner.run(&spec).await {
            Ok(output) => Ok(output.success()),
            Err(TransferError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Establish how to authenticate: keys first, then up to
    /// [`MAX_PASSWORD_ATTEMPTS`] passwords from `credentials`.
    pub async fn connect(&self, credentials: &dyn CredentialSource) -> Result<(), TransferError> {
        if self.check_key_auth().await {
            info!("Key-based SSH login to {} works", self.remote_host);
            self.lock().auth = Some(AuthMethod::Key);
            return Ok(());
        }

        info!("Key-based login to {} failed, falling back to password", self.remote_host);
        if !self.runner.is_installed("sshpass") {
            return Err(TransferError::capability("sshpass", SSHPASS_HINT));
        }

        let mut attempts = 0;
        while attempts < MAX_PASSWORD_ATTEMPTS {
            let Some(password) = credentials.password(&self.remote_host, attempts + 1).await else {
                break;
            };
            attempts += 1;

            if self.test_password(&password).await? {
                info!("Password login to {} succeeded", self.remote_host);
                self.lock().auth = Some(AuthMethod::Password(password));
                return Ok(());
            }
            warn!(
                "Password rejected by {} (attempt {}/{})",
                self.remote_host, attempts, MAX_PASSWORD_ATTEMPTS
            );
        }

        Err(TransferError::RemoteAuthFailed {
            host: self.remote_host.clone(),
            attempts,
        })
    }

    pub async fn create_remote_directory(&self) -> Result<(), TransferError> {
        let command = format!("mkdir -p {}", remote_path_quote(&self.remote_dir));
        let spec = ssh_command(&self.remote_host, self.password().as_deref(), &command)
            .timeout(Duration::from_secs(30));
        let output = self.runner.run(&spec).await?;
        if output.success() {
            Ok(())
        } else {
            Err(TransferError::CommandFailed(format!(
                "mkdir -p {} on {}: {}",
                self.remote_dir,
                self.remote_host,
                output.failure_reason()
            )))
        }
    }

    fn remote_target(&self) -> String {
        format!("{}:{}/", self.remote_host, self.remote_dir.trim_end_matches('/'))
    }

    /// Command an operator can run by hand to finish a failed copy.
    pub fn recovery_command(&self) -> String {
        let copy = format!("scp {}/* {}", self.staging_dir.display(), self.remote_target());
        if self.password().is_some() {
            format!("SSHPASS='YOUR_PASSWORD' sshpass -e {}", copy)
        } else {
            copy
        }
    }

    fn bulk_copy_command(&self, files: &[PathBuf]) -> CommandSpec {
        let scp = CommandSpec::new("scp").args(["-p", "-C"]);
        let spec = match self.password() {
            Some(password) => CommandSpec::new("sshpass")
                .args(["-e", "scp", "-p", "-C"])
                .env("SSHPASS", password),
            None => scp,
        };
        spec.args(files.iter().map(|f| f.display().to_string()))
            .arg(self.remote_target())
    }

    /// Copy every staged file in one `scp -p -C`. On failure the files stay in
    /// the staging directory and the error carries a manual recovery command.
    pub async fn bulk_transfer(&self) -> Result<(), TransferError> {
        let files = {
            let mut state = self.lock();
            if state.files.is_empty() {
                state.phase = TransferPhase::Completed;
                return Ok(());
            }
            state.phase = TransferPhase::Transferring;
            state.files.clone()
        };

        for file in &files {
            if !file.exists() {
                let err = TransferError::MissingLocalFile(file.clone());
                self.mark_failed(&err.to_string(), None);
                return Err(err);
            }
        }

        info!(
            "Transferring {} file(s) to {}",
            files.len(),
            self.remote_target()
        );

        let spec = self.bulk_copy_command(&files);
        let reason = match self.runner.run(&spec).await {
            Ok(output) if output.success() => None,
            Ok(output) => Some(output.failure_reason()),
            Err(e) => Some(e.to_string()),
        };

        match reason {
            None => {
                info!("Transferred all files to {}", self.remote_host);
                self.lock().phase = TransferPhase::Completed;
                self.cleanup();
                Ok(())
            }
            Some(reason) => {
                let recovery_command = self.recovery_command();
                error!("Transfer to {} failed: {}", self.remote_host, reason);
                self.mark_failed(&reason, Some(recovery_command.clone()));
                Err(TransferError::BulkCopyFailed {
                    reason,
                    staging_dir: self.staging_dir.clone(),
                    recovery_command,
                })
            }
        }
    }

    fn mark_failed(&self, reason: &str, recovery_command: Option<String>) {
        let mut state = self.lock();
        state.phase = TransferPhase::Failed;
        state.error = Some(reason.to_string());
        state.recovery_command = recovery_command;
    }

    /// Remove the staging directory and everything in it.
    pub fn cleanup(&self) {
        if self.staging_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.staging_dir) {
                warn!("Could not remove {:?}: {}", self.staging_dir, e);
            }
        }
    }
}
