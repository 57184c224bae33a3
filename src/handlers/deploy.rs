use anyhow::{Result, anyhow};
use console::{Term, style};
use distroget::config::Config;
use distroget::download::DownloadOptions;
use distroget::pipeline::{CombinedPipeline, ProxmoxDeployment};
use distroget::transfer::{ProxmoxTarget, SystemCommandRunner};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{authenticate_proxmox, finish_display, print_summary, spawn_progress_display};

pub struct DeployArgs {
    pub urls: Vec<String>,
    pub proxmox_host: Option<String>,
    pub user: Option<String>,
    pub storage: Option<String>,
    pub workers: Option<usize>,
}

pub async fn handle_deploy(config: &Config, args: DeployArgs) -> Result<()> {
    let term = Term::stdout();

    let hostname = args
        .proxmox_host
        .or_else(|| config.proxmox.hostname.clone())
        .ok_or_else(|| anyhow!("No Proxmox host given. Use --proxmox-host or set proxmox.hostname"))?;
    let username = args.user.unwrap_or_else(|| config.proxmox.username.clone());

    let target = Arc::new(ProxmoxTarget::new(
        Arc::new(SystemCommandRunner::new()),
        hostname.clone(),
        username,
    ));

    term.write_line(&format!(
        "{} Connecting to {}...",
        style("🔐").cyan(),
        style(target.destination()).bold()
    ))?;
    authenticate_proxmox(&target).await?;

    let options = DownloadOptions::from_config(config);
    let worker_count = args.workers.unwrap_or(options.max_workers);
    let (pipeline, events) = CombinedPipeline::proxmox(
        options,
        ProxmoxDeployment {
            target,
            storage: args.storage,
            mappings: config.proxmox.storage_mappings.clone(),
        },
    )?;

    let display = spawn_progress_display(events, false);
    pipeline.start(worker_count);
    for url in &args.urls {
        pipeline.enqueue(url);
    }

    let uploads: Mutex<HashMap<PathBuf, ProgressBar>> = Mutex::new(HashMap::new());
    let on_upload = |file: &Path, percent: u8| {
        let mut uploads = uploads.lock().unwrap_or_else(|p| p.into_inner());
        let bar = uploads.entry(file.to_path_buf()).or_insert_with(|| {
            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg:30!} [{bar:30.green}] {pos}%")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.set_message(format!(
                "⬆ {}",
                file.file_name().unwrap_or_default().to_string_lossy()
            ));
            bar
        });
        bar.set_position(u64::from(percent));
        if percent >= 100 {
            bar.finish();
        }
    };

    let deployed = pipeline.wait_and_deploy(&on_upload).await;
    for bar in uploads.lock().unwrap_or_else(|p| p.into_inner()).values() {
        if !bar.is_finished() {
            bar.abandon();
        }
    }

    let snapshot = pipeline.snapshot();
    drop(pipeline);
    finish_display(display).await;
    print_summary(&term, &snapshot)?;

    let upload_failed = match deployed {
        Ok(results) => results.iter().any(|r| !r.success),
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            true
        }
    };
    if upload_failed || snapshot.downloads.has_failures() {
        std::process::exit(1);
    }

    term.write_line(&format!(
        "{} Deployed to {}",
        style("✅").green(),
        style(hostname).bold()
    ))?;
    Ok(())
}
