//! Deployment of downloaded artifacts to remote hosts.
//!
//! Nothing here speaks SSH itself: every remote operation shells out to the
//! system `ssh`, `scp`, `rsync` and `sshpass` through [`RemoteCommandRunner`].

pub mod proxmox;
pub mod runner;
pub mod scp;

pub use proxmox::{ContentKind, ProxmoxTarget, StorageTarget, UploadProgress};
pub use runner::{CommandOutput, CommandSpec, RemoteCommandRunner, SystemCommandRunner};
pub use scp::{CredentialSource, TransferJob, TransferManager, TransferPhase, TransferStatus};
