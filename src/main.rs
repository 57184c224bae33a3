mod cli;
mod handlers;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use distroget::config::ConfigManager;
use handlers::deploy::DeployArgs;
use handlers::fetch::FetchArgs;
use std::path::Path;
use std::process;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Append-only writer for the persistent log. Events are flushed when the
/// guard is dropped.
fn log_file_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("log_file has no file name: {:?}", path))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name.to_string_lossy())
        .build(dir)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Console gets WARN (DEBUG with `--verbose`, RUST_LOG wins over both). The
/// log file always gets INFO.
fn init_logging(verbose: bool, log_file: &Path) -> Option<WorkerGuard> {
    let default_level = if verbose { "debug" } else { "warn" };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let console = fmt::layer().with_writer(std::io::stderr).with_filter(console_filter);

    let (file, guard) = match log_file_writer(log_file) {
        Ok((writer, guard)) => {
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(LevelFilter::INFO);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!("Warning: not logging to {:?}: {}", log_file, e);
            (None, None)
        }
    };

    tracing_subscriber::registry().with(console).with(file).init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Validate CLI arguments first
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    let config_manager = match &args.config {
        Some(path) => ConfigManager::load_from(path.clone())?,
        None => ConfigManager::new()?,
    };

    let _log_guard = init_logging(args.verbose, &config_manager.config().general.log_file);
    tracing::info!("distroget {} started", env!("CARGO_PKG_VERSION"));

    if !args.skips_config_validation() {
        if let Err(e) = config_manager.validate() {
            eprintln!("Configuration validation failed: {}", e);
            eprintln!("Run 'distroget config validate' for details");
            process::exit(1);
        }
    }

    let config = config_manager.config();
    match args.command {
        Commands::Fetch {
            urls,
            dest,
            workers,
            no_verify,
            no_decompress,
            links,
            json,
            delete_failed,
        } => {
            handlers::handle_fetch(
                config,
                FetchArgs {
                    urls,
                    dest,
                    workers,
                    no_verify,
                    no_decompress,
                    links,
                    json,
                    delete_failed,
                },
            )
            .await?;
        }
        Commands::Deploy {
            urls,
            proxmox_host,
            user,
            storage,
            workers,
        } => {
            handlers::handle_deploy(
                config,
                DeployArgs {
                    urls,
                    proxmox_host,
                    user,
                    storage,
                    workers,
                },
            )
            .await?;
        }
        Commands::Verify { file, url, digest } => {
            handlers::handle_verify(config, &file, url.as_deref(), digest.as_deref()).await?;
        }
        Commands::Storages { host, user } => {
            handlers::handle_storages(config, host, user).await?;
        }
        Commands::Config { action } => {
            handlers::handle_config(&config_manager, action).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use distroget::download::DownloadOptions;
    use std::sync::Once;
    use tempfile::TempDir;

    static INIT: Once = Once::new();

    fn init_test_logging() {
        INIT.call_once(|| {
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_test_writer()
                .init();
        });
    }

    #[test]
    fn test_config_file_override() -> Result<()> {
        init_test_logging();

        let dir = TempDir::new()?;
        let path = dir.path().join("custom.toml");
        let cli = Cli::try_parse_from([
            "distroget",
            "--config",
            path.to_str().unwrap(),
            "config",
            "show",
        ])?;

        let manager = ConfigManager::load_from(cli.config.clone().unwrap())?;
        assert!(path.exists(), "Missing config file should be created");
        assert!(manager.validate().is_ok());
        Ok(())
    }

    #[test]
    fn test_log_file_writer_creates_directory() -> Result<()> {
        use std::io::Write;
        init_test_logging();

        let dir = TempDir::new()?;
        let path = dir.path().join("logs/nested/distroget.log");
        let (mut writer, guard) = log_file_writer(&path)?;
        writer.write_all(b"first line\n")?;
        drop(guard);

        let content = std::fs::read_to_string(&path)?;
        assert!(content.contains("first line"));

        // Appends on reopen instead of truncating.
        let (mut writer, guard) = log_file_writer(&path)?;
        writer.write_all(b"second line\n")?;
        drop(guard);
        let content = std::fs::read_to_string(&path)?;
        assert!(content.contains("first line") && content.contains("second line"));
        Ok(())
    }

    #[test]
    fn test_options_follow_config() -> Result<()> {
        init_test_logging();

        let dir = TempDir::new()?;
        let mut manager = ConfigManager::load_from(dir.path().join("config.toml"))?;
        manager.config_mut().general.max_workers = 5;
        manager.config_mut().retry.max_retries = 7;
        manager.save()?;

        let reloaded = ConfigManager::load_from(dir.path().join("config.toml"))?;
        let options = DownloadOptions::from_config(reloaded.config());
        assert_eq!(options.max_workers, 5);
        assert_eq!(options.max_retries, 7);
        Ok(())
    }
}
