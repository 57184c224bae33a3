pub mod config;
pub mod download;
pub mod error;
pub mod links;
pub mod pipeline;
pub mod transfer;

// Re-export commonly used types for easier access in tests
pub use config::{Config, ConfigManager};
pub use download::{
    DownloadJob, DownloadManager, DownloadOptions, DownloadProgress, DownloadSnapshot, Fetcher,
    HashVerifier, JobState, VerificationResult,
};
pub use error::{ArchiveError, DownloadError, TransferError};
pub use links::LinkNode;
pub use pipeline::{CombinedPipeline, Destination, DeploymentResult, PipelineSnapshot};
pub use transfer::{ProxmoxTarget, TransferManager};
