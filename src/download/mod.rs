pub mod archive;
pub mod checksum;
pub mod engine;
pub mod manager;
pub mod progress;
pub mod torrent;

pub use archive::ArchiveExpander;
pub use checksum::{ChecksumType, ChecksumVerifier, HashVerifier, VerificationResult};
pub use engine::{DownloadEngine, FetchProgress, Fetcher, ProgressCallback};
pub use manager::{DownloadJob, DownloadManager, DownloadOptions, DownloadSnapshot, JobState};
pub use progress::{DownloadProgress, ProgressTracker};
pub use torrent::TorrentDownloader;
