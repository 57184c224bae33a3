use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while fetching a single artifact.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error fetching {url}: {message}")]
    TransientNetwork { url: String, message: String },

    #[error("HTTP request for {url} failed with status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{tool} is not installed. {hint}")]
    CapabilityMissing { tool: String, hint: String },

    #[error("torrent download failed: {0}")]
    Torrent(String),
}

impl DownloadError {
    /// Whether the job owning this error should be re-queued.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DownloadError::CapabilityMissing { .. })
    }

    pub fn network(url: &str, err: impl std::fmt::Display) -> Self {
        DownloadError::TransientNetwork {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive member '{member}' escapes the destination directory")]
    PathTraversal { member: String },

    #[error("unsupported archive format: {0}")]
    Unsupported(PathBuf),

    #[error("archive {0} contains no files")]
    Empty(PathBuf),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by remote deployment targets.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{tool} is not installed. {hint}")]
    CapabilityMissing { tool: String, hint: String },

    #[error("authentication to {host} failed after {attempts} attempt(s)")]
    RemoteAuthFailed { host: String, attempts: u32 },

    #[error("command `{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("remote command failed: {0}")]
    CommandFailed(String),

    #[error(
        "bulk transfer failed ({reason}); files are still available in {}. Transfer them manually with:\n  {recovery_command}",
        staging_dir.display()
    )]
    BulkCopyFailed {
        reason: String,
        staging_dir: PathBuf,
        recovery_command: String,
    },

    #[error("could not discover storages on {host}: {reason}")]
    StorageDiscovery { host: String, reason: String },

    #[error("no enabled storage on {host} accepts '{content}' content")]
    NoCompatibleStorage { host: String, content: String },

    #[error("could not determine path for storage '{0}'")]
    UnknownStoragePath(String),

    #[error("upload of {file} failed: {reason}")]
    UploadFailed { file: String, reason: String },

    #[error("local file not found: {0}")]
    MissingLocalFile(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn capability(tool: &str, hint: &str) -> Self {
        TransferError::CapabilityMissing {
            tool: tool.to_string(),
            hint: hint.to_string(),
        }
    }
}
