use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{LazyLock, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info};

use super::engine::{FetchProgress, ProgressCallback, safe_file_name};
use crate::error::DownloadError;

pub const ARIA2C: &str = "aria2c";

/// Trailing stderr lines kept for the error of a failed run.
const STDERR_TAIL_LINES: usize = 5;

const INSTALL_HINT: &str = "Install it to enable torrent downloads \
(apt install aria2 / dnf install aria2 / zypper install aria2 / pacman -S aria2 / brew install aria2).";

static PERCENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\((\d+)%\)").unwrap());
static SIZES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)(B|KiB|MiB|GiB)/(\d+(?:\.\d+)?)(B|KiB|MiB|GiB)").unwrap()
});
static SPEED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DL:(\d+(?:\.\d+)?)(B|KiB|MiB|GiB)").unwrap());
static CONNECTIONS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"CN:(\d+)").unwrap());
static MAGNET_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[&?]dn=([^&]+)").unwrap());

/// Progress parsed from aria2c's summary lines, e.g.
/// `[#1a2b3c 7.5MiB/100MiB(7%) CN:5 DL:2.5MiB ETA:30s]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TorrentStatus {
    pub percent: u8,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub speed_bps: u64,
    pub connections: u32,
}

impl TorrentStatus {
    /// Fold one output line into the running status. Fields absent from the
    /// line keep their previous values.
    pub fn update(&mut self, line: &str) {
        if let Some(caps) = PERCENT.captures(line) {
            self.percent = caps[1].parse().unwrap_or(self.percent);
        }
        if let Some(caps) = SIZES.captures(line) {
            if let (Ok(done), Ok(total)) = (caps[1].parse::<f64>(), caps[3].parse::<f64>()) {
                self.bytes_downloaded = to_bytes(done, &caps[2]);
                self.total_bytes = to_bytes(total, &caps[4]);
            }
        }
        if let Some(caps) = SPEED.captures(line) {
            if let Ok(speed) = caps[1].parse::<f64>() {
                self.speed_bps = to_bytes(speed, &caps[2]);
            }
        }
        if let Some(caps) = CONNECTIONS.captures(line) {
            self.connections = caps[1].parse().unwrap_or(self.connections);
        }
    }

    pub fn as_fetch_progress(&self) -> FetchProgress {
        FetchProgress {
            bytes_downloaded: self.bytes_downloaded,
            total_bytes: self.total_bytes,
            speed_bps: self.speed_bps,
        }
    }
}

fn to_bytes(value: f64, unit: &str) -> u64 {
    let multiplier = match unit {
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    (value * multiplier) as u64
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                (Some(high), Some(low)) => {
                    out.push(high << 4 | low);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Delegates `.torrent` and `magnet:` sources to an external aria2c process.
pub struct TorrentDownloader {
    binary: String,
    available: Mutex<Option<bool>>,
}

impl TorrentDownloader {
    pub fn new() -> Self {
        Self::with_binary(ARIA2C)
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            available: Mutex::new(None),
        }
    }

    pub fn is_torrent_url(url: &str) -> bool {
        let lower = url.to_lowercase();
        lower.ends_with(".torrent") || lower.starts_with("magnet:")
    }

    /// Whether the torrent client is installed. Checked once per downloader.
    pub fn is_available(&self) -> bool {
        let mut cached = self
            .available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cached.get_or_insert_with(|| {
            let found = which::which(&self.binary).is_ok();
            debug!("{} available: {}", self.binary, found);
            found
        })
    }

    /// Name of the file aria2c will produce for `url`. Always a single path
    /// component, so joining it never leaves the target directory.
    pub fn output_filename(url: &str) -> String {
        let candidate = if url.starts_with("magnet:") {
            MAGNET_NAME.captures(url).map(|caps| percent_decode(&caps[1]))
        } else {
            const SUFFIX: &str = ".torrent";
            let name = url.rsplit('/').next().unwrap_or(url);
            let split = name.len().saturating_sub(SUFFIX.len());
            match (name.get(..split), name.get(split..)) {
                (Some(stem), Some(suffix)) if suffix.eq_ignore_ascii_case(SUFFIX) => {
                    Some(stem.to_string())
                }
                _ => Some(name.to_string()),
            }
        };

        candidate
            .as_deref()
            .and_then(safe_file_name)
            .unwrap_or_else(|| "download".to_string())
    }

    fn build_command(&self, url: &str, target_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--dir")
            .arg(target_dir)
            .args([
                "--seed-time=0",
                "--summary-interval=1",
                "--console-log-level=notice",
                "--max-connection-per-server=5",
                "--split=5",
                "--file-allocation=none",
                "--check-certificate=true",
            ])
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run aria2c for `url` into `target_dir`, forwarding progress in the same
    /// shape the HTTP engine reports.
    pub async fn download(
        &self,
        url: &str,
        target_dir: &Path,
        progress: ProgressCallback<'_>,
    ) -> Result<PathBuf, DownloadError> {
        info!("Starting torrent download: {}", url);

        if !self.is_available() {
            error!("{} is not available", self.binary);
            return Err(DownloadError::CapabilityMissing {
                tool: self.binary.clone(),
                hint: INSTALL_HINT.to_string(),
            });
        }

        tokio::fs::create_dir_all(target_dir).await?;

        let mut child = self.build_command(url, target_dir).spawn()?;
        let mut status = TorrentStatus::default();

        // Drained concurrently so a chatty client never blocks on a full pipe.
        let stderr_tail = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    debug!("aria2c stderr: {}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
                Vec::from(tail).join(" | ")
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                debug!("aria2c output: {}", line.trim());
                status.update(&line);
                progress(status.as_fetch_progress());
            }
        }

        let exit = child.wait().await?;
        let stderr = match stderr_tail {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        if !exit.success() {
            error!("{} failed with {}: {}", self.binary, exit, stderr);
            let message = if stderr.is_empty() {
                format!("{} exited with {}", self.binary, exit)
            } else {
                format!("{} exited with {}: {}", self.binary, exit, stderr)
            };
            return Err(DownloadError::Torrent(message));
        }

        let filepath = target_dir.join(Self::output_filename(url));
        if filepath.exists() {
            info!("Torrent download completed: {:?}", filepath);
            Ok(filepath)
        } else {
            Err(DownloadError::Torrent(format!(
                "downloaded file not found: {}",
                filepath.display()
            )))
        }
    }
}

impl Default for TorrentDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_torrent_url() {
        assert!(TorrentDownloader::is_torrent_url(
            "https://releases.ubuntu.com/24.04/ubuntu-24.04-desktop-amd64.iso.TORRENT"
        ));
        assert!(TorrentDownloader::is_torrent_url("magnet:?xt=urn:btih:abcdef"));
        assert!(!TorrentDownloader::is_torrent_url(
            "https://releases.ubuntu.com/24.04/ubuntu-24.04-desktop-amd64.iso"
        ));
    }

    #[test]
    fn test_progress_parsing() {
        let mut status = TorrentStatus::default();
        status.update("[#1a2b3c 7.5MiB/100MiB(7%) CN:5 DL:2.5MiB ETA:30s]");
        assert_eq!(status.percent, 7);
        assert_eq!(status.bytes_downloaded, (7.5 * 1024.0 * 1024.0) as u64);
        assert_eq!(status.total_bytes, 100 * 1024 * 1024);
        assert_eq!(status.speed_bps, (2.5 * 1024.0 * 1024.0) as u64);
        assert_eq!(status.connections, 5);

        // Lines without a summary keep the previous numbers
        status.update("01/01 12:00:00 [NOTICE] Seeding is over.");
        assert_eq!(status.connections, 5);

        status.update("[#1a2b3c 1.2GiB/4.5GiB(26%) CN:12 DL:800KiB]");
        assert_eq!(status.total_bytes, (4.5 * 1024.0 * 1024.0 * 1024.0) as u64);
        assert_eq!(status.speed_bps, 800 * 1024);
    }

    #[test]
    fn test_output_filename() {
        assert_eq!(
            TorrentDownloader::output_filename(
                "https://releases.ubuntu.com/24.04/ubuntu-24.04-desktop-amd64.iso.torrent"
            ),
            "ubuntu-24.04-desktop-amd64.iso"
        );
        assert_eq!(
            TorrentDownloader::output_filename(
                "magnet:?xt=urn:btih:abc&dn=debian-12.5.0-amd64-netinst.iso&tr=udp%3A%2F%2Ftracker"
            ),
            "debian-12.5.0-amd64-netinst.iso"
        );
        assert_eq!(
            TorrentDownloader::output_filename("magnet:?xt=urn:btih:abc&dn=Kali%20Linux.iso"),
            "Kali Linux.iso"
        );
        assert_eq!(
            TorrentDownloader::output_filename("magnet:?xt=urn:btih:abc"),
            "download"
        );
    }

    #[test]
    fn test_magnet_name_stays_in_target_dir() {
        assert_eq!(
            TorrentDownloader::output_filename("magnet:?xt=urn:btih:abc&dn=%2Fetc%2Fshadow"),
            "shadow"
        );
        assert_eq!(
            TorrentDownloader::output_filename("magnet:?xt=urn:btih:abc&dn=..%2F..%2Fboot.img"),
            "boot.img"
        );
        assert_eq!(
            TorrentDownloader::output_filename("magnet:?xt=urn:btih:abc&dn=..%5C..%5Cwin.iso"),
            "win.iso"
        );
        assert_eq!(
            TorrentDownloader::output_filename("magnet:?xt=urn:btih:abc&dn=.."),
            "download"
        );
        assert_eq!(
            TorrentDownloader::output_filename("magnet:?xt=urn:btih:abc&dn=isos%2F"),
            "download"
        );
    }

    #[tokio::test]
    async fn test_missing_client_fails_fast() {
        let temp_dir = TempDir::new().unwrap();
        let downloader = TorrentDownloader::with_binary("distroget-no-such-aria2c");
        assert!(!downloader.is_available());

        let err = downloader
            .download("magnet:?xt=urn:btih:abc", temp_dir.path(), &|_: FetchProgress| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::CapabilityMissing { .. }));
        assert!(!err.is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_client_stderr_is_reported() -> anyhow::Result<()> {
        // `sh` rejects aria2c's flags on stderr and exits non-zero.
        let temp_dir = TempDir::new()?;
        let downloader = TorrentDownloader::with_binary("sh");
        assert!(downloader.is_available());

        let err = downloader
            .download("magnet:?xt=urn:btih:abc", temp_dir.path(), &|_: FetchProgress| {})
            .await
            .unwrap_err();
        match err {
            DownloadError::Torrent(message) => {
                assert!(message.starts_with("sh exited with"), "{}", message);
                assert!(message.to_lowercase().contains("option"), "{}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        Ok(())
    }
}
