use anyhow::{Result, anyhow};
use console::{Term, style};
use distroget::config::Config;
use distroget::download::ProgressTracker;
use distroget::transfer::{ProxmoxTarget, SystemCommandRunner};
use std::sync::Arc;

use super::authenticate_proxmox;

// pvesm reports sizes in KiB.
fn kib(value: Option<u64>) -> String {
    value
        .map(|v| ProgressTracker::format_bytes(v.saturating_mul(1024)))
        .unwrap_or_else(|| "-".to_string())
}

pub async fn handle_storages(config: &Config, host: Option<String>, user: Option<String>) -> Result<()> {
    let term = Term::stdout();

    let hostname = host
        .or_else(|| config.proxmox.hostname.clone())
        .ok_or_else(|| anyhow!("No Proxmox host given. Use --host or set proxmox.hostname"))?;
    let username = user.unwrap_or_else(|| config.proxmox.username.clone());
    let target = ProxmoxTarget::new(Arc::new(SystemCommandRunner::new()), hostname, username);

    authenticate_proxmox(&target).await?;
    let storages = target.discover_storages().await?;

    if storages.is_empty() {
        term.write_line(&format!("{} No storage pools found", style("⚠").yellow()))?;
        return Ok(());
    }

    term.write_line(&format!(
        "{} Storage pools on {}:",
        style("💾").cyan(),
        style(target.hostname()).bold()
    ))?;
    term.write_line("")?;
    term.write_line(&format!(
        "  {:<16} {:<10} {:<10} {:>10} {:>10}  {}",
        "NAME", "TYPE", "STATUS", "USED", "AVAIL", "CONTENT"
    ))?;

    for storage in &storages {
        let status = if storage.enabled {
            style(storage.status.as_str()).green()
        } else {
            style(storage.status.as_str()).red()
        };
        term.write_line(&format!(
            "  {:<16} {:<10} {:<10} {:>10} {:>10}  {}",
            storage.name,
            storage.storage_type,
            status,
            kib(storage.used),
            kib(storage.available),
            storage.content.join(",")
        ))?;
        if let Some(path) = &storage.path {
            term.write_line(&format!("  {}", style(path).dim()))?;
        }
    }

    Ok(())
}
