use std::path::PathBuf;
use std::time::Duration;

/// Events broadcast by the download manager as jobs move through the pipeline.
#[derive(Debug, Clone)]
pub enum DownloadProgress {
    Started {
        url: String,
        output_path: PathBuf,
    },
    Progress {
        url: String,
        bytes_downloaded: u64,
        total_bytes: u64,
        progress_percent: u8,
        speed_bps: u64,
    },
    VerifyingChecksum {
        url: String,
    },
    ChecksumVerified {
        url: String,
        path: PathBuf,
    },
    ChecksumFailed {
        url: String,
        path: PathBuf,
        reason: String,
    },
    ChecksumUnknown {
        url: String,
        path: PathBuf,
        reason: String,
    },
    Decompressed {
        url: String,
        from: PathBuf,
        to: PathBuf,
    },
    Completed {
        url: String,
        path: PathBuf,
    },
    Retry {
        url: String,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        error: String,
    },
    Failed {
        url: String,
        error: String,
        attempts: u32,
    },
}

impl DownloadProgress {
    pub fn url(&self) -> &str {
        match self {
            DownloadProgress::Started { url, .. }
            | DownloadProgress::Progress { url, .. }
            | DownloadProgress::VerifyingChecksum { url }
            | DownloadProgress::ChecksumVerified { url, .. }
            | DownloadProgress::ChecksumFailed { url, .. }
            | DownloadProgress::ChecksumUnknown { url, .. }
            | DownloadProgress::Decompressed { url, .. }
            | DownloadProgress::Completed { url, .. }
            | DownloadProgress::Retry { url, .. }
            | DownloadProgress::Failed { url, .. } => url,
        }
    }
}

pub fn percent(bytes_downloaded: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        return 0;
    }
    ((bytes_downloaded as f64 / total_bytes as f64) * 100.0).min(100.0) as u8
}

pub struct ProgressTracker;

impl ProgressTracker {
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.1} {}", size, UNITS[unit_index])
        }
    }

    pub fn format_speed(bytes_per_second: u64) -> String {
        format!("{}/s", Self::format_bytes(bytes_per_second))
    }

    pub fn calculate_eta(
        bytes_downloaded: u64,
        total_bytes: u64,
        speed_bps: u64,
    ) -> Option<Duration> {
        if speed_bps == 0 || total_bytes == 0 || bytes_downloaded >= total_bytes {
            return None;
        }

        let remaining_bytes = total_bytes - bytes_downloaded;
        Some(Duration::from_secs(remaining_bytes / speed_bps))
    }

    /// `"2.0 MB/s, ETA 1m 5s"` from a measured rate. `None` until the
    /// transport has reported a speed.
    pub fn rate_summary(bytes_downloaded: u64, total_bytes: u64, speed_bps: u64) -> Option<String> {
        if speed_bps == 0 {
            return None;
        }
        let speed = Self::format_speed(speed_bps);
        Some(match Self::calculate_eta(bytes_downloaded, total_bytes, speed_bps) {
            Some(eta) => format!("{}, ETA {}", speed, Self::format_duration(eta)),
            None => speed,
        })
    }

    pub fn format_duration(duration: Duration) -> String {
        let total_seconds = duration.as_secs();
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }
}
