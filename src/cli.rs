use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "distroget")]
#[command(about = "Fetch, verify and deploy Linux installation and cloud images")]
#[command(long_about = "
distroget downloads installation ISOs and cloud images over HTTP(S) or
BitTorrent, verifies them against the checksums their distribution publishes,
decompresses them and deploys the result to a local directory, a remote host
over SCP, or a Proxmox VE storage pool.

Examples:
  distroget fetch https://cdimage.debian.org/.../debian-12.5.0-amd64-netinst.iso
  distroget fetch --links links.json --dest root@nas:/srv/iso
  distroget deploy https://.../alpine-virt-3.20.3-x86_64.iso --proxmox-host pve.lan
  distroget verify ubuntu-24.04-desktop-amd64.iso --url https://releases.ubuntu.com/24.04/ubuntu-24.04-desktop-amd64.iso
  distroget storages --host pve.lan
")]
#[command(version)]
pub struct Cli {
    /// Override config file path
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download, verify and decompress artifacts
    #[command(visible_alias = "f")]
    Fetch {
        /// URLs to download (HTTP, HTTPS, .torrent or magnet:)
        urls: Vec<String>,

        /// Destination directory or host:path for SCP
        #[arg(short, long, value_name = "DEST")]
        #[arg(help = "Local directory or host:path (defaults to the configured download_dir)")]
        dest: Option<String>,

        /// Number of parallel download workers
        #[arg(short, long, value_name = "N")]
        workers: Option<usize>,

        /// Skip checksum verification
        #[arg(long)]
        no_verify: bool,

        /// Keep compressed artifacts as downloaded
        #[arg(long)]
        no_decompress: bool,

        /// JSON link tree whose URLs are added to the queue
        #[arg(short, long, value_name = "FILE")]
        links: Option<PathBuf>,

        /// Print the final status snapshot as JSON
        #[arg(long)]
        json: bool,

        /// Delete files whose checksum did not match
        #[arg(long)]
        delete_failed: bool,
    },

    /// Download artifacts and upload them to a Proxmox VE host
    #[command(visible_alias = "d")]
    Deploy {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Proxmox VE hostname (defaults to proxmox.hostname from config)
        #[arg(long, value_name = "HOST")]
        proxmox_host: Option<String>,

        /// SSH user on the Proxmox host
        #[arg(short, long, value_name = "USER")]
        user: Option<String>,

        /// Storage pool to upload into
        #[arg(short, long, value_name = "POOL")]
        #[arg(help = "Storage pool (defaults to the configured pool per content kind)")]
        storage: Option<String>,

        /// Number of parallel download workers
        #[arg(short, long, value_name = "N")]
        workers: Option<usize>,
    },

    /// Verify a local file against a digest or its published checksum
    Verify {
        /// File to verify
        file: PathBuf,

        /// URL the file was downloaded from
        #[arg(short, long, value_name = "URL")]
        url: Option<String>,

        /// Expected digest (MD5, SHA-1, SHA-256 or SHA-512 in hex)
        #[arg(short, long, value_name = "HEX")]
        digest: Option<String>,
    },

    /// List storage pools on a Proxmox VE host
    Storages {
        /// Proxmox VE hostname
        #[arg(long, value_name = "HOST")]
        host: Option<String>,

        /// SSH user on the Proxmox host
        #[arg(short, long, value_name = "USER")]
        user: Option<String>,
    },

    /// Manage configuration
    #[command(visible_alias = "cfg")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Only show one section (general, retry, proxmox)
        section: Option<String>,
    },

    /// Validate configuration
    #[command(visible_alias = "check")]
    Validate,

    /// Create sample configuration
    Sample,
}

impl Cli {
    /// Validate CLI arguments and show helpful error messages
    pub fn validate(&self) -> Result<(), String> {
        match &self.command {
            Commands::Fetch {
                urls,
                links,
                workers,
                ..
            } => {
                if urls.is_empty() && links.is_none() {
                    return Err("Provide at least one URL or --links FILE".to_string());
                }
                check_workers(*workers)?;
            }
            Commands::Deploy { workers, .. } => check_workers(*workers)?,
            Commands::Verify { url, digest, .. } => {
                if url.is_none() && digest.is_none() {
                    return Err("Provide --url or --digest to verify against".to_string());
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Check if command can run with an invalid configuration
    pub fn skips_config_validation(&self) -> bool {
        matches!(
            self.command,
            Commands::Config {
                action: ConfigAction::Validate | ConfigAction::Sample | ConfigAction::Show { .. }
            }
        )
    }
}

fn check_workers(workers: Option<usize>) -> Result<(), String> {
    match workers {
        Some(n) if n == 0 || n > 16 => Err("Workers must be between 1 and 16".to_string()),
        _ => Ok(()),
    }
}
