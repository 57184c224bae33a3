use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::runner::{
    CommandSpec, RemoteCommandRunner, key_check_command, remote_path_quote, shell_quote, ssh_command,
};
use crate::error::TransferError;

pub type UploadProgress<'a> = &'a (dyn Fn(u8) + Send + Sync);

static RSYNC_PERCENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d{1,3})%").unwrap());

const STORAGE_CFG: &str = "/etc/pve/storage.cfg";
const SSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Kinds of content this tool deploys to a Proxmox storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Iso,
    Vztmpl,
    Snippets,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Iso => "iso",
            ContentKind::Vztmpl => "vztmpl",
            ContentKind::Snippets => "snippets",
        }
    }

    /// Directory below the pool's base path holding this kind.
    pub fn subdir(self) -> &'static str {
        match self {
            ContentKind::Iso => "template/iso",
            ContentKind::Vztmpl => "template/cache",
            ContentKind::Snippets => "snippets",
        }
    }

    /// Classify a file by extension. Disk images are stored as ISO content.
    pub fn detect(filename: &str) -> Self {
        let lower = filename.to_lowercase();
        if [".tar.gz", ".tar.xz", ".tar.zst"]
            .iter()
            .any(|ext| lower.ends_with(ext))
        {
            ContentKind::Vztmpl
        } else if lower.ends_with(".yaml") || lower.ends_with(".yml") {
            ContentKind::Snippets
        } else {
            ContentKind::Iso
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "iso" => Ok(ContentKind::Iso),
            "vztmpl" => Ok(ContentKind::Vztmpl),
            "snippets" => Ok(ContentKind::Snippets),
            other => Err(format!("unknown content kind '{}'", other)),
        }
    }
}

/// One storage pool as reported by `pvesm status` and `storage.cfg`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageTarget {
    pub name: String,
    pub storage_type: String,
    pub status: String,
    pub enabled: bool,
    pub content: Vec<String>,
    pub total: Option<u64>,
    pub used: Option<u64>,
    pub available: Option<u64>,
    pub path: Option<String>,
}

impl StorageTarget {
    pub fn accepts(&self, kind: ContentKind) -> bool {
        self.content.iter().any(|c| c == kind.as_str())
    }
}

/// A pool's section in `/etc/pve/storage.cfg`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageConfigEntry {
    pub storage_type: String,
    pub content: Vec<String>,
    pub path: Option<String>,
    pub disabled: bool,
}

/// Parse `pvesm status`. The header row is optional and trailing columns may
/// be missing or non-numeric.
pub fn parse_pvesm_status(output: &str) -> Vec<StorageTarget> {
    output
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|parts| parts.len() >= 3)
        .filter(|parts| !parts[0].eq_ignore_ascii_case("name"))
        .map(|parts| {
            let column = |i: usize| parts.get(i).and_then(|v| v.parse::<u64>().ok());
            let status = parts[2].to_string();
            StorageTarget {
                name: parts[0].to_string(),
                storage_type: parts[1].to_string(),
                enabled: matches!(status.to_lowercase().as_str(), "active" | "available"),
                status,
                content: Vec::new(),
                total: column(3),
                used: column(4),
                available: column(5),
                path: None,
            }
        })
        .collect()
}

/// Parse `/etc/pve/storage.cfg` into per-pool entries keyed by pool name.
pub fn parse_storage_cfg(content: &str) -> HashMap<String, StorageConfigEntry> {
    let mut entries = HashMap::new();
    let mut current: Option<(String, StorageConfigEntry)> = None;

    for line in content.lines() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let indented = line.starts_with(char::is_whitespace);
        if !indented {
            if let Some((name, entry)) = current.take() {
                entries.insert(name, entry);
            }
            if let Some((storage_type, name)) = line.split_once(':') {
                current = Some((
                    name.trim().to_string(),
                    StorageConfigEntry {
                        storage_type: storage_type.trim().to_string(),
                        ..Default::default()
                    },
                ));
            }
            continue;
        }

        let Some((_, entry)) = current.as_mut() else {
            continue;
        };
        let mut parts = line.trim().splitn(2, char::is_whitespace);
        let key = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default().trim();
        match key {
            "content" => {
                entry.content = value
                    .split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect();
            }
            "path" => entry.path = Some(value.to_string()),
            "disable" => entry.disabled = true,
            _ => {}
        }
    }

    if let Some((name, entry)) = current {
        entries.insert(name, entry);
    }
    entries
}

/// Base directory of a pool from `pvesm path <pool>:iso/dummy`.
fn base_from_volume_path(path: &str) -> Option<String> {
    let path = path.trim();
    for marker in ["/template/iso/", "/template/cache/"] {
        if let Some((base, _)) = path.split_once(marker) {
            return Some(base.to_string());
        }
    }
    None
}

/// Filenames from `pvesm list`, whose first column is `<pool>:<kind>/<file>`.
fn parse_volume_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|volid| !volid.eq_ignore_ascii_case("volid"))
        .filter_map(|volid| volid.rsplit_once('/').map(|(_, file)| file.to_string()))
        .collect()
}

/// A Proxmox VE host reached over SSH.
pub struct ProxmoxTarget {
    runner: Arc<dyn RemoteCommandRunner>,
    hostname: String,
    username: String,
    password: Mutex<Option<String>>,
    storages: Mutex<Option<Vec<StorageTarget>>>,
}

impl ProxmoxTarget {
    pub fn new(
        runner: Arc<dyn RemoteCommandRunner>,
        hostname: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            hostname: hostname.into(),
            username: username.into(),
            password: Mutex::new(None),
            storages: Mutex::new(None),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }

    pub fn set_password(&self, password: Option<String>) {
        *self
            .password
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = password;
    }

    fn password(&self) -> Option<String> {
        self.password
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn ssh(&self, remote_command: &str) -> CommandSpec {
        ssh_command(&self.destination(), self.password().as_deref(), remote_command)
            .timeout(SSH_TIMEOUT)
    }

    /// Whether key-based login works without a password.
    pub async fn check_ssh_keys(&self) -> bool {
        self.runner
            .run(&key_check_command(&self.destination()))
            .await
            .map(|output| output.success())
            .unwrap_or(false)
    }

    pub async fn test_connection(&self) -> Result<(), TransferError> {
        let output = self.runner.run(&self.ssh("pvesm status")).await?;
        if output.success() {
            info!("Connected to Proxmox host {}", self.hostname);
            Ok(())
        } else {
            Err(TransferError::CommandFailed(format!(
                "connection to {} failed: {}",
                self.hostname,
                output.failure_reason()
            )))
        }
    }

    /// Storage pools with their content kinds. Cached after the first success.
    pub async fn discover_storages(&self) -> Result<Vec<StorageTarget>, TransferError> {
        if let Some(cached) = self
            .storages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            return Ok(cached.clone());
        }

        let output = self
            .runner
            .run(&self.ssh("pvesm status"))
            .await
            .map_err(|e| TransferError::StorageDiscovery {
                host: self.hostname.clone(),
                reason: e.to_string(),
            })?;
        if !output.success() {
            return Err(TransferError::StorageDiscovery {
                host: self.hostname.clone(),
                reason: output.failure_reason(),
            });
        }

        let mut storages = parse_pvesm_status(&output.stdout);
        if storages.is_empty() {
            return Err(TransferError::StorageDiscovery {
                host: self.hostname.clone(),
                reason: "pvesm status listed no storages".to_string(),
            });
        }

        let config = match self.runner.run(&self.ssh(&format!("cat {}", STORAGE_CFG))).await {
            Ok(output) if output.success() => parse_storage_cfg(&output.stdout),
            Ok(output) => {
                warn!("Could not read {}: {}", STORAGE_CFG, output.failure_reason());
                HashMap::new()
            }
            Err(e) => {
                warn!("Could not read {}: {}", STORAGE_CFG, e);
                HashMap::new()
            }
        };

        for storage in &mut storages {
            match config.get(&storage.name) {
                Some(entry) => {
                    storage.content = entry.content.clone();
                    storage.path = entry.path.clone();
                    if entry.disabled {
                        storage.enabled = false;
                    }
                }
                None => storage.content = vec!["iso".to_string(), "vztmpl".to_string()],
            }
        }

        debug!("Discovered {} storages on {}", storages.len(), self.hostname);
        *self
            .storages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(storages.clone());
        Ok(storages)
    }

    /// Filesystem base path of `storage`.
    pub async fn storage_path(&self, storage: &str) -> Result<String, TransferError> {
        let command = format!("pvesm path {}", shell_quote(&format!("{}:iso/dummy", storage)));
        match self.runner.run(&self.ssh(&command)).await {
            Ok(output) if output.success() => {
                if let Some(base) = base_from_volume_path(&output.stdout) {
                    return Ok(base);
                }
            }
            Ok(output) => debug!("pvesm path failed: {}", output.failure_reason()),
            Err(e) => debug!("pvesm path failed: {}", e),
        }

        self.discover_storages()
            .await
            .ok()
            .and_then(|storages| {
                storages
                    .into_iter()
                    .find(|s| s.name == storage)
                    .and_then(|s| s.path)
            })
            .ok_or_else(|| TransferError::UnknownStoragePath(storage.to_string()))
    }

    /// Pick `preferred` if it is enabled and accepts `kind`, otherwise the
    /// first pool that does.
    pub async fn select_storage(
        &self,
        kind: ContentKind,
        preferred: Option<&str>,
    ) -> Result<StorageTarget, TransferError> {
        let storages = self.discover_storages().await?;
        let compatible = |s: &&StorageTarget| s.enabled && s.accepts(kind);

        let selected = match preferred {
            Some(name) => storages.iter().filter(compatible).find(|s| s.name == name),
            None => storages.iter().find(compatible),
        };

        selected.cloned().ok_or_else(|| TransferError::NoCompatibleStorage {
            host: self.hostname.clone(),
            content: match preferred {
                Some(name) => format!("{} (on pool {})", kind, name),
                None => kind.to_string(),
            },
        })
    }

    /// Upload `local_path` into `storage` under the directory for `kind`.
    /// Returns the resulting volume id, e.g. `local:iso/alpine.iso`.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        storage: &str,
        kind: ContentKind,
        progress: UploadProgress<'_>,
    ) -> Result<String, TransferError> {
        if !local_path.exists() {
            return Err(TransferError::MissingLocalFile(local_path.to_path_buf()));
        }
        let filename = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| TransferError::MissingLocalFile(local_path.to_path_buf()))?;

        let base = self.storage_path(storage).await?;
        let remote_dir = format!("{}/{}", base.trim_end_matches('/'), kind.subdir());
        let remote_path = format!("{}/{}", remote_dir, filename);
        let upload_failed = |reason: String| TransferError::UploadFailed {
            file: filename.clone(),
            reason,
        };

        let mkdir = self
            .runner
            .run(&self.ssh(&format!("mkdir -p {}", remote_path_quote(&remote_dir))))
            .await?;
        if !mkdir.success() {
            return Err(upload_failed(format!(
                "could not create {}: {}",
                remote_dir,
                mkdir.failure_reason()
            )));
        }

        info!("Uploading {} to {}:{}", filename, storage, kind.subdir());
        let rsync = self.rsync_command(local_path, &remote_path);
        let output = self
            .runner
            .run_streaming(&rsync, &|line: &str| {
                if let Some(caps) = RSYNC_PERCENT.captures(line) {
                    if let Ok(percent) = caps[1].parse::<u8>() {
                        progress(percent.min(100));
                    }
                }
            })
            .await?;
        if !output.success() {
            return Err(upload_failed(output.failure_reason()));
        }

        let chmod = self
            .runner
            .run(&self.ssh(&format!("chmod 644 {}", remote_path_quote(&remote_path))))
            .await;
        match chmod {
            Ok(output) if output.success() => {}
            Ok(output) => warn!("chmod 644 {} failed: {}", remote_path, output.failure_reason()),
            Err(e) => warn!("chmod 644 {} failed: {}", remote_path, e),
        }

        Ok(format!("{}:{}/{}", storage, kind.as_str(), filename))
    }

    fn rsync_command(&self, local_path: &Path, remote_path: &str) -> CommandSpec {
        let transport = match self.password() {
            Some(_) => "sshpass -e ssh -o StrictHostKeyChecking=accept-new",
            None => "ssh -o BatchMode=yes -o StrictHostKeyChecking=accept-new",
        };
        let spec = CommandSpec::new("rsync")
            .args(["-avz", "--partial", "--progress", "-e", transport])
            .arg(local_path.display().to_string())
            .arg(format!("{}:{}", self.destination(), remote_path));
        match self.password() {
            Some(password) => spec.env("SSHPASS", password),
            None => spec,
        }
    }

    /// Files of `kind` already stored in `storage`.
    pub async fn list_files(
        &self,
        storage: &str,
        kind: ContentKind,
    ) -> Result<Vec<String>, TransferError> {
        let command = format!("pvesm list {} --content {}", shell_quote(storage), kind);
        let output = self.runner.run(&self.ssh(&command)).await?;
        if !output.success() {
            return Err(TransferError::CommandFailed(format!(
                "pvesm list {}: {}",
                storage,
                output.failure_reason()
            )));
        }
        Ok(parse_volume_list(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::runner::CommandOutput;
    use crate::transfer::runner::testing::ScriptedRunner;
    use tempfile::TempDir;

    const PVESM_STATUS: &str = "\
Name             Type     Status           Total            Used       Available        %
local             dir     active        98497780        12345678        81085684   12.53%
local-lvm     lvmthin     active       832888832       123456789       709432043   14.82%
nas               nfs   inactive               0               0               0    N/A
";

    const STORAGE_CFG_TEXT: &str = "\
dir: local
\tpath /var/lib/vz
\tcontent iso,vztmpl,backup

lvmthin: local-lvm
\tthinpool data
\tvgname pve
\tcontent rootdir,images

nfs: nas
\tpath /mnt/pve/nas
\tserver 10.0.0.5
\texport /export/pve
\tcontent iso,snippets
";

    fn pve_runner() -> Arc<ScriptedRunner> {
        Arc::new(ScriptedRunner::new(&["ssh", "sshpass", "rsync"], |spec| {
            let remote = spec.args.last().cloned().unwrap_or_default();
            if remote == "pvesm status" {
                CommandOutput::ok(PVESM_STATUS)
            } else if remote.starts_with("cat /etc/pve/storage.cfg") {
                CommandOutput::ok(STORAGE_CFG_TEXT)
            } else if remote == "pvesm path local:iso/dummy" {
                CommandOutput::ok("/var/lib/vz/template/iso/dummy\n")
            } else if remote.starts_with("pvesm path") {
                CommandOutput::failed(2, "storage does not exist")
            } else if spec.program == "rsync" {
                CommandOutput::ok("alpine.iso\r  32,768  50%\r  65,536 100%\n")
            } else {
                CommandOutput::ok("")
            }
        }))
    }

    #[test]
    fn test_content_kind_detection() {
        assert_eq!(ContentKind::detect("ubuntu-24.04-live-server-amd64.iso"), ContentKind::Iso);
        assert_eq!(ContentKind::detect("jammy-server-cloudimg-amd64.IMG"), ContentKind::Iso);
        assert_eq!(ContentKind::detect("disk.qcow2"), ContentKind::Iso);
        assert_eq!(
            ContentKind::detect("debian-12-standard_12.7-1_amd64.tar.zst"),
            ContentKind::Vztmpl
        );
        assert_eq!(ContentKind::detect("cloud-init.yml"), ContentKind::Snippets);
        assert_eq!(ContentKind::detect("README"), ContentKind::Iso);
        assert_eq!("vztmpl".parse::<ContentKind>(), Ok(ContentKind::Vztmpl));
        assert!("backup".parse::<ContentKind>().is_err());
    }

    #[test]
    fn test_parse_pvesm_status() {
        let storages = parse_pvesm_status(PVESM_STATUS);
        assert_eq!(storages.len(), 3);
        assert_eq!(storages[0].name, "local");
        assert_eq!(storages[0].storage_type, "dir");
        assert!(storages[0].enabled);
        assert_eq!(storages[0].total, Some(98497780));
        assert_eq!(storages[0].available, Some(81085684));
        assert!(!storages[2].enabled);

        // no header, short rows
        let storages = parse_pvesm_status("local dir active\nbroken\n");
        assert_eq!(storages.len(), 1);
        assert_eq!(storages[0].total, None);
    }

    #[test]
    fn test_parse_storage_cfg() {
        let entries = parse_storage_cfg(STORAGE_CFG_TEXT);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries["local"].content, vec!["iso", "vztmpl", "backup"]);
        assert_eq!(entries["local"].path.as_deref(), Some("/var/lib/vz"));
        assert_eq!(entries["local-lvm"].storage_type, "lvmthin");
        assert_eq!(entries["local-lvm"].path, None);
        assert_eq!(entries["nas"].content, vec!["iso", "snippets"]);

        let entries = parse_storage_cfg("dir: old\n\tpath /srv\n\tdisable\n");
        assert!(entries["old"].disabled);
    }

    #[test]
    fn test_volume_helpers() {
        assert_eq!(
            base_from_volume_path("/var/lib/vz/template/iso/dummy\n").as_deref(),
            Some("/var/lib/vz")
        );
        assert_eq!(base_from_volume_path("/dev/pve/dummy"), None);
        assert_eq!(
            parse_volume_list(
                "Volid                         Format  Type      Size VMID\nlocal:iso/alpine.iso iso iso 123 \nlocal:iso/debian.iso iso iso 456\n"
            ),
            vec!["alpine.iso", "debian.iso"]
        );
    }

    #[tokio::test]
    async fn test_discovery_and_selection() -> anyhow::Result<()> {
        let runner = pve_runner();
        let pve = ProxmoxTarget::new(runner.clone(), "pve.lan", "root");

        let storages = pve.discover_storages().await?;
        assert!(storages[0].accepts(ContentKind::Iso));
        assert!(!storages[1].accepts(ContentKind::Iso));

        // cached
        let calls = runner.calls().len();
        pve.discover_storages().await?;
        assert_eq!(runner.calls().len(), calls);

        assert_eq!(pve.select_storage(ContentKind::Iso, None).await?.name, "local");
        // nas accepts snippets but is inactive
        let err = pve.select_storage(ContentKind::Snippets, None).await.unwrap_err();
        assert!(matches!(err, TransferError::NoCompatibleStorage { .. }));
        let err = pve
            .select_storage(ContentKind::Iso, Some("local-lvm"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NoCompatibleStorage { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_storage_path_falls_back_to_config() -> anyhow::Result<()> {
        let pve = ProxmoxTarget::new(pve_runner(), "pve.lan", "root");
        assert_eq!(pve.storage_path("local").await?, "/var/lib/vz");
        assert_eq!(pve.storage_path("nas").await?, "/mnt/pve/nas");
        let err = pve.storage_path("local-lvm").await.unwrap_err();
        assert!(matches!(err, TransferError::UnknownStoragePath(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_runs_mkdir_rsync_chmod() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let iso = temp_dir.path().join("alpine.iso");
        std::fs::write(&iso, b"iso")?;

        let runner = pve_runner();
        let pve = ProxmoxTarget::new(runner.clone(), "pve.lan", "root");
        pve.set_password(Some("secret".to_string()));

        let seen = Mutex::new(Vec::new());
        let volume = pve
            .upload_file(&iso, "local", ContentKind::Iso, &|p: u8| seen.lock().unwrap().push(p))
            .await?;
        assert_eq!(volume, "local:iso/alpine.iso");
        assert_eq!(seen.into_inner().unwrap(), vec![50, 100]);

        let lines = runner.command_lines();
        let tail: Vec<&String> = lines.iter().rev().take(3).collect();
        assert!(tail[2].ends_with("mkdir -p /var/lib/vz/template/iso"));
        assert!(tail[1].starts_with("rsync -avz --partial --progress"));
        assert!(tail[1].ends_with("root@pve.lan:/var/lib/vz/template/iso/alpine.iso"));
        assert!(tail[0].ends_with("chmod 644 /var/lib/vz/template/iso/alpine.iso"));
        assert!(lines.iter().all(|l| !l.contains("secret")));

        let rsync = runner
            .calls()
            .into_iter()
            .find(|c| c.program == "rsync")
            .unwrap();
        assert_eq!(rsync.env, vec![("SSHPASS".to_string(), "secret".to_string())]);
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_missing_file() {
        let pve = ProxmoxTarget::new(pve_runner(), "pve.lan", "root");
        let err = pve
            .upload_file(Path::new("/nonexistent/x.iso"), "local", ContentKind::Iso, &|_: u8| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::MissingLocalFile(_)));
    }
}
