//! Host aliases, worker list and profile exports

use async_trait::async_trait;
use nix::unistd::{chown, Group, User};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use super::MembershipSink;
use crate::aws::InstanceMetadataClient;
use crate::config::{BootstrapConfig, ProvisionPaths};
use crate::error::{BootstrapError, Result};
use crate::protocol::MembershipView;

/// Host alias of the master
pub const MASTER_ALIAS: &str = "deeplearning-master";

/// Instance families that carry GPUs
const GPU_FAMILIES: &[&str] = &["g3", "g4dn", "g4ad", "g5", "g6", "p2", "p3", "p4d", "p5"];

/// Host alias of the worker at 1-based `index`
pub fn worker_alias(index: usize) -> String {
    format!("deeplearning-worker{}", index)
}

/// True when `instance_type` belongs to a GPU family
pub fn is_gpu_instance_type(instance_type: &str) -> bool {
    let family = instance_type.split('.').next().unwrap_or_default();
    GPU_FAMILIES.contains(&family)
}

/// Number of GPUs on this node
#[async_trait]
pub trait GpuInventory: Send + Sync {
    async fn gpu_count(&self) -> Result<u32>;
}

/// A known GPU count
#[derive(Debug, Clone, Copy)]
pub struct FixedGpuCount(pub u32);

#[async_trait]
impl GpuInventory for FixedGpuCount {
    async fn gpu_count(&self) -> Result<u32> {
        Ok(self.0)
    }
}

/// Counts GPUs with `nvidia-smi -L` on GPU instance types
pub struct NvidiaSmiInventory {
    metadata: Arc<InstanceMetadataClient>,
    command: PathBuf,
}

impl NvidiaSmiInventory {
    pub fn new(metadata: Arc<InstanceMetadataClient>) -> Self {
        Self {
            metadata,
            command: PathBuf::from("nvidia-smi"),
        }
    }
}

#[async_trait]
impl GpuInventory for NvidiaSmiInventory {
    async fn gpu_count(&self) -> Result<u32> {
        let instance_type = self.metadata.instance_type().await?;
        if !is_gpu_instance_type(&instance_type) {
            info!("{} is not a GPU instance, number of GPUs: 0", instance_type);
            return Ok(0);
        }

        let output = match Command::new(&self.command).arg("-L").output().await {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!(
                    "{} exited with {}: {}",
                    self.command.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                return Ok(0);
            }
            Err(e) => {
                warn!("Failed to run {}: {}", self.command.display(), e);
                return Ok(0);
            }
        };

        let count = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count() as u32;
        info!("Number of GPUs: {}", count);
        Ok(count)
    }
}

/// Writes the membership into the node's host, worker and profile files
pub struct HostFileWriter {
    paths: ProvisionPaths,
    default_user: String,
    efs_mount: PathBuf,
    gpus: Arc<dyn GpuInventory>,
}

impl HostFileWriter {
    pub fn new(config: &BootstrapConfig, gpus: Arc<dyn GpuInventory>) -> Self {
        Self {
            paths: config.paths.clone(),
            default_user: config.default_user.clone(),
            efs_mount: config.efs_mount.clone(),
            gpus,
        }
    }

    /// `/etc/hosts` lines for the view
    pub fn host_entries(view: &MembershipView) -> String {
        let mut entries = format!("{} {}\n", view.master(), MASTER_ALIAS);
        for (i, worker) in view.workers().iter().enumerate() {
            entries.push_str(&format!("{} {}\n", worker, worker_alias(i + 1)));
        }
        entries
    }

    /// Worker list file content, one alias per line
    pub fn worker_list(view: &MembershipView) -> String {
        (1..=view.workers().len())
            .map(|i| format!("{}\n", worker_alias(i)))
            .collect()
    }

    fn profile_exports(&self, worker_count: usize, gpu_count: u32) -> String {
        format!(
            "export DEEPLEARNING_WORKERS_COUNT={}\n\
             export DEEPLEARNING_WORKERS_PATH={}\n\
             export DEEPLEARNING_WORKER_GPU_COUNT={}\n\
             export EFS_MOUNT={}\n",
            worker_count,
            self.paths.workers_file.display(),
            gpu_count,
            self.efs_mount.display()
        )
    }

    /// Hand `path` to the default user and the group of the same name,
    /// falling back to the user's primary group
    fn chown_to_default_user(&self, path: &Path) -> Result<()> {
        let name = &self.default_user;
        let user = User::from_name(name)
            .map_err(|e| lookup_failed(name, "user", e))?
            .ok_or_else(|| unknown_user(name))?;
        let gid = match Group::from_name(name).map_err(|e| lookup_failed(name, "group", e))? {
            Some(group) => group.gid,
            None => {
                warn!("No group named {}, using primary group {}", name, user.gid);
                user.gid
            }
        };

        chown(path, Some(user.uid), Some(gid)).map_err(|e| BootstrapError::io(path, e.into()))?;
        info!("Changed owner of {} to {} ({}:{})", path.display(), name, user.uid, gid);
        Ok(())
    }
}

#[async_trait]
impl MembershipSink for HostFileWriter {
    async fn apply(&self, view: &MembershipView) -> Result<()> {
        info!("Provisioning membership: master {}, workers {:?}", view.master(), view.workers());

        append(&self.paths.hosts_file, &Self::host_entries(view)).await?;

        if let Some(parent) = self.paths.workers_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BootstrapError::io(parent, e))?;
        }
        tokio::fs::write(&self.paths.workers_file, Self::worker_list(view))
            .await
            .map_err(|e| BootstrapError::io(&self.paths.workers_file, e))?;

        let gpu_count = self.gpus.gpu_count().await?;
        append(
            &self.paths.profile_script,
            &self.profile_exports(view.workers().len(), gpu_count),
        )
        .await?;

        self.chown_to_default_user(&self.paths.workers_file)
    }
}

async fn append(path: &Path, content: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| BootstrapError::io(path, e))?;
    file.write_all(content.as_bytes())
        .await
        .map_err(|e| BootstrapError::io(path, e))?;
    file.flush().await.map_err(|e| BootstrapError::io(path, e))
}

fn unknown_user(name: &str) -> BootstrapError {
    BootstrapError::InvalidConfig {
        key: "AWS_DL_DEFAULT_USER".into(),
        reason: format!("no user named {}", name),
    }
}

fn lookup_failed(name: &str, database: &str, err: nix::Error) -> BootstrapError {
    BootstrapError::InvalidConfig {
        key: "AWS_DL_DEFAULT_USER".into(),
        reason: format!("{} lookup for {} failed: {}", database, name, err),
    }
}
