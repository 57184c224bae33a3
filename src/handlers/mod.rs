pub mod config;
pub mod deploy;
pub mod fetch;
pub mod storages;
pub mod verify;

use anyhow::Result;
use async_trait::async_trait;
use console::{Term, style};
use dialoguer::Password;
use distroget::download::{DownloadProgress, ProgressTracker};
use distroget::error::TransferError;
use distroget::pipeline::PipelineSnapshot;
use distroget::transfer::scp::MAX_PASSWORD_ATTEMPTS;
use distroget::transfer::{CredentialSource, ProxmoxTarget};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use config::handle_config;
pub use deploy::handle_deploy;
pub use fetch::handle_fetch;
pub use storages::handle_storages;
pub use verify::handle_verify;

/// Asks the operator for a password on the terminal.
pub struct PromptCredentials;

#[async_trait]
impl CredentialSource for PromptCredentials {
    async fn password(&self, destination: &str, attempt: u32) -> Option<String> {
        let prompt = format!(
            "Password for {} (attempt {}/{})",
            destination, attempt, MAX_PASSWORD_ATTEMPTS
        );
        tokio::task::spawn_blocking(move || Password::new().with_prompt(prompt).interact().ok())
            .await
            .ok()
            .flatten()
    }
}

/// Use SSH keys if they work, otherwise prompt until a password is accepted.
pub async fn authenticate_proxmox(target: &ProxmoxTarget) -> Result<(), TransferError> {
    if target.check_ssh_keys().await {
        return target.test_connection().await;
    }

    let destination = target.destination();
    let mut attempts = 0;
    while attempts < MAX_PASSWORD_ATTEMPTS {
        let Some(password) = PromptCredentials.password(&destination, attempts + 1).await else {
            break;
        };
        attempts += 1;
        target.set_password(Some(password));
        match target.test_connection().await {
            Ok(()) => return Ok(()),
            Err(TransferError::CommandFailed(reason)) => {
                eprintln!("{} {}", style("✗").red(), reason);
            }
            Err(e) => return Err(e),
        }
    }

    Err(TransferError::RemoteAuthFailed {
        host: target.hostname().to_string(),
        attempts,
    })
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{msg:30!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {prefix}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn short_name(url: &str) -> String {
    url.rsplit('/').next().unwrap_or(url).to_string()
}

/// Render download events as one progress bar per URL until the channel closes.
pub fn spawn_progress_display(
    mut events: mpsc::UnboundedReceiver<DownloadProgress>,
    hidden: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let multi = if hidden {
            MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        let mut bars: HashMap<String, ProgressBar> = HashMap::new();

        while let Some(event) = events.recv().await {
            let url = event.url().to_string();
            let bar = bars
                .entry(url.clone())
                .or_insert_with(|| {
                    let bar = multi.add(ProgressBar::new(0));
                    bar.set_style(bar_style());
                    bar.set_message(short_name(&url));
                    bar
                })
                .clone();

            match event {
                DownloadProgress::Started { .. } => bar.reset(),
                DownloadProgress::Progress {
                    bytes_downloaded,
                    total_bytes,
                    speed_bps,
                    ..
                } => {
                    if total_bytes > 0 {
                        bar.set_length(total_bytes);
                    }
                    bar.set_position(bytes_downloaded);
                    // The engine's windowed rate; indicatif would count a
                    // resumed prefix as throughput.
                    if let Some(rate) = ProgressTracker::rate_summary(bytes_downloaded, total_bytes, speed_bps) {
                        bar.set_prefix(rate);
                    }
                }
                DownloadProgress::VerifyingChecksum { .. } => {
                    bar.set_message(format!("{} (verifying)", short_name(&url)));
                }
                DownloadProgress::ChecksumVerified { path, .. } => {
                    let _ = multi.println(format!("{} checksum OK: {}", style("✓").green(), path.display()));
                }
                DownloadProgress::ChecksumFailed { path, reason, .. } => {
                    let _ = multi.println(format!(
                        "{} checksum FAILED for {}: {}",
                        style("✗").red(),
                        path.display(),
                        reason
                    ));
                }
                DownloadProgress::ChecksumUnknown { reason, .. } => {
                    let _ = multi.println(format!("{} {}: {}", style("?").yellow(), short_name(&url), reason));
                }
                DownloadProgress::Decompressed { to, .. } => {
                    let _ = multi.println(format!("{} decompressed to {}", style("📦").cyan(), to.display()));
                }
                DownloadProgress::Retry {
                    attempt,
                    max_attempts,
                    delay,
                    error,
                    ..
                } => {
                    bar.set_message(format!(
                        "{} (retry {}/{} in {})",
                        short_name(&url),
                        attempt,
                        max_attempts,
                        ProgressTracker::format_duration(delay.max(Duration::from_secs(1)))
                    ));
                    let _ = multi.println(format!("{} {}: {}", style("↻").yellow(), short_name(&url), error));
                }
                DownloadProgress::Completed { .. } => {
                    bar.set_prefix("");
                    bar.finish_with_message(format!("{} {}", style("✓").green(), short_name(&url)));
                }
                DownloadProgress::Failed { error, attempts, .. } => {
                    bar.abandon_with_message(format!(
                        "{} {} after {} attempt(s): {}",
                        style("✗").red(),
                        short_name(&url),
                        attempts,
                        error
                    ));
                }
            }
        }
    })
}

/// Wait briefly for the display task to render the last events.
pub async fn finish_display(display: JoinHandle<()>) {
    let _ = tokio::time::timeout(Duration::from_secs(2), display).await;
}

pub fn print_summary(term: &Term, snapshot: &PipelineSnapshot) -> Result<()> {
    let downloads = &snapshot.downloads;
    term.write_line("")?;
    term.write_line(&format!(
        "{} {} completed, {} failed ({} submitted)",
        style("📊").cyan(),
        style(downloads.completed).green(),
        if downloads.failed > 0 {
            style(downloads.failed).red()
        } else {
            style(downloads.failed).dim()
        },
        downloads.submitted
    ))?;

    for job in downloads.jobs.iter().filter(|job| job.retry_count > 0 || job.last_error.is_some()) {
        term.write_line(&format!(
            "   {} retries: {}{}",
            job.filename,
            job.retry_count,
            job.last_error
                .as_deref()
                .map(|e| format!(", last error: {}", e))
                .unwrap_or_default()
        ))?;
    }

    for (path, result) in &downloads.verification {
        let marker = if result.is_verified() {
            style("✓").green()
        } else if result.is_failed() {
            style("✗").red()
        } else {
            style("?").yellow()
        };
        term.write_line(&format!("   {} {}: {}", marker, path, result.message()))?;
    }

    for result in &snapshot.deployments {
        let marker = if result.success {
            style("✓").green()
        } else {
            style("✗").red()
        };
        term.write_line(&format!(
            "   {} {} -> {}",
            marker,
            result.file.display(),
            result.location.as_deref().unwrap_or(&result.message)
        ))?;
    }

    Ok(())
}
