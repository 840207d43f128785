//! Stack completion signal through `cfn-signal`

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::info;

use super::CompletionSignal;
use crate::aws::InstanceMetadataClient;
use crate::config::BootstrapConfig;
use crate::error::{BootstrapError, Result};

/// Runs `cfn-signal --success true` against the stack's wait handle
pub struct CfnSignal {
    command: PathBuf,
    region: String,
    stack_id: String,
    wait_handle: String,
    metadata: Arc<InstanceMetadataClient>,
}

impl CfnSignal {
    pub fn new(config: &BootstrapConfig, metadata: Arc<InstanceMetadataClient>) -> Self {
        Self {
            command: config.cfn_path.join("cfn-signal"),
            region: config.region.clone(),
            stack_id: config.stack_id.clone(),
            wait_handle: config.wait_handle.clone(),
            metadata,
        }
    }

    fn args(&self, instance_id: &str) -> Vec<String> {
        vec![
            "--region".into(),
            self.region.clone(),
            "--stack".into(),
            self.stack_id.clone(),
            "--success".into(),
            "true".into(),
            "--id".into(),
            instance_id.to_string(),
            self.wait_handle.clone(),
        ]
    }
}

#[async_trait]
impl CompletionSignal for CfnSignal {
    async fn signal_success(&self) -> Result<()> {
        let instance_id = self.metadata.instance_id().await?;
        let args = self.args(&instance_id);
        info!("Running {} {}", self.command.display(), args.join(" "));

        let output = Command::new(&self.command)
            .args(&args)
            .output()
            .await
            .map_err(|e| BootstrapError::SignalFailed {
                reason: format!("failed to run {}: {}", self.command.display(), e),
            })?;

        if !output.status.success() {
            return Err(BootstrapError::SignalFailed {
                reason: format!(
                    "{} exited with {}: {}",
                    self.command.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        info!("cfn-signal: {}", String::from_utf8_lossy(&output.stdout).trim());
        Ok(())
    }
}
