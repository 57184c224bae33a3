use anyhow::{Context, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::transfer::ContentKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub proxmox: ProxmoxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
    #[serde(default = "default_true")]
    pub decompress: bool,
    /// Persistent log, always written at INFO regardless of `--verbose`.
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: f64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Defaults for `deploy`. Passwords are prompted for and never written here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxmoxConfig {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub storage_mappings: StorageMappings,
}

/// Preferred storage pool per content kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageMappings {
    #[serde(default)]
    pub iso: Option<String>,
    #[serde(default)]
    pub vztmpl: Option<String>,
    #[serde(default)]
    pub snippets: Option<String>,
}

impl StorageMappings {
    pub fn for_kind(&self, kind: ContentKind) -> Option<&str> {
        match kind {
            ContentKind::Iso => self.iso.as_deref(),
            ContentKind::Vztmpl => self.vztmpl.as_deref(),
            ContentKind::Snippets => self.snippets.as_deref(),
        }
    }
}

// Default value functions
fn default_download_dir() -> PathBuf {
    UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(|d| d.join("distroget")))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}
fn default_log_file() -> PathBuf {
    ProjectDirs::from("", "", "distroget")
        .map(|dirs| dirs.data_local_dir().join("distroget.log"))
        .unwrap_or_else(|| PathBuf::from("distroget.log"))
}
fn default_max_workers() -> usize {
    3
}
fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_secs() -> f64 {
    1.0
}
fn default_chunk_size() -> usize {
    8 * 1024
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_username() -> String {
    "root".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_workers: default_max_workers(),
            verify_checksums: true,
            decompress: true,
            log_file: default_log_file(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            chunk_size: default_chunk_size(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            username: default_username(),
            storage_mappings: StorageMappings::default(),
        }
    }
}

pub struct ConfigManager {
    config_dir: PathBuf,
    config_file: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Load the per-user config, writing the defaults on first run.
    pub fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from("", "", "distroget")
            .context("Failed to determine config directory")?;
        Self::load_from(project_dirs.config_dir().join("config.toml"))
    }

    /// Load `config_file`, creating it with defaults if it does not exist.
    pub fn load_from(config_file: PathBuf) -> Result<Self> {
        let config_dir = config_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
        }

        let config = if config_file.exists() {
            Self::load_config(&config_file)?
        } else {
            let default_config = Config::default();
            Self::save_config(&config_file, &default_config)?;
            default_config
        };

        Ok(Self {
            config_dir,
            config_file,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn save(&self) -> Result<()> {
        Self::save_config(&self.config_file, &self.config)
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    fn load_config(config_file: &Path) -> Result<Config> {
        let content = fs::read_to_string(config_file)
            .with_context(|| format!("Failed to read config file: {:?}", config_file))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", config_file))
    }

    fn save_config(config_file: &Path, config: &Config) -> Result<()> {
        let content = toml::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(config_file, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_file))?;

        Ok(())
    }

    /// Write the defaults next to the real config for reference.
    pub fn create_sample_config(&self) -> Result<PathBuf> {
        let sample_file = self.config_dir.join("config.sample.toml");
        Self::save_config(&sample_file, &Config::default())?;
        Ok(sample_file)
    }

    pub fn validate(&self) -> Result<()> {
        let config = &self.config;

        if config.general.max_workers == 0 {
            anyhow::bail!("max_workers must be greater than 0");
        }
        if config.retry.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than 0");
        }
        if config.retry.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than 0");
        }
        if !config.retry.backoff_base_secs.is_finite() || config.retry.backoff_base_secs < 0.0 {
            anyhow::bail!("backoff_base_secs must be a non-negative number");
        }
        if config.general.log_file.as_os_str().is_empty() {
            anyhow::bail!("log_file cannot be empty");
        }
        if config.proxmox.username.is_empty() {
            anyhow::bail!("proxmox.username cannot be empty");
        }
        if let Some(host) = &config.proxmox.hostname {
            if host.trim().is_empty() {
                anyhow::bail!("proxmox.hostname cannot be blank");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_load_writes_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("nested/config.toml");

        let manager = ConfigManager::load_from(path.clone())?;
        assert!(path.exists());
        assert_eq!(manager.config().general.max_workers, 3);
        assert_eq!(manager.config().retry.max_retries, 3);
        assert_eq!(manager.config().retry.chunk_size, 8192);
        manager.validate()?;
        Ok(())
    }

    #[test]
    fn test_partial_file_uses_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            "[retry]\nmax_retries = 5\n\n[proxmox]\nhostname = \"pve.lan\"\n\n[proxmox.storage_mappings]\niso = \"nas\"\n",
        )?;

        let manager = ConfigManager::load_from(path)?;
        let config = manager.config();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_base_secs, 1.0);
        assert!(config.general.log_file.ends_with("distroget.log"));
        assert_eq!(config.proxmox.hostname.as_deref(), Some("pve.lan"));
        assert_eq!(config.proxmox.username, "root");
        assert_eq!(config.proxmox.storage_mappings.for_kind(ContentKind::Iso), Some("nas"));
        assert_eq!(config.proxmox.storage_mappings.for_kind(ContentKind::Vztmpl), None);
        Ok(())
    }

    #[test]
    fn test_validation_rejects_zero_workers() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut manager = ConfigManager::load_from(temp_dir.path().join("config.toml"))?;
        manager.config_mut().general.max_workers = 0;
        assert!(manager.validate().is_err());

        manager.config_mut().general.max_workers = 2;
        manager.config_mut().retry.backoff_base_secs = -1.0;
        assert!(manager.validate().is_err());
        Ok(())
    }
}
