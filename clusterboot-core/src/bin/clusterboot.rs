//! Cluster bootstrap binary
//!
//! Runs one bootstrap episode for this node and exits 0 on success, 1 on
//! any failure.

use std::path::Path;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use clusterboot_core::aws::{default_provider, AwsService, InstanceMetadataClient, ServiceClient};
use clusterboot_core::channel::{SqsChannel, SqsConfig};
use clusterboot_core::fleet::AwsFleetDirectory;
use clusterboot_core::provision::{CfnSignal, HostFileWriter, NvidiaSmiInventory};
use clusterboot_core::{BootstrapConfig, BootstrapEpisode, EpisodeServices, MembershipView, Result};

const LOG_FILE: &str = "clusterboot.log";

fn init_logging(log_dir: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut file_error = None;
    let file_layer = log_dir.and_then(|dir| {
        let path = dir.join(LOG_FILE);
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            ),
            Err(e) => {
                file_error = Some(format!("{}: {}", path.display(), e));
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    if let Some(reason) = file_error {
        error!("Logging to console only, cannot open log file {}", reason);
    }
}

async fn run(config: BootstrapConfig) -> Result<MembershipView> {
    let metadata = Arc::new(InstanceMetadataClient::new(config.metadata())?);
    let credentials = default_provider(|key| std::env::var(key).ok(), metadata.clone(), &config.role_name);

    let sqs = |queue: &str| -> Result<SqsChannel> {
        let client = ServiceClient::new(
            AwsService::Sqs,
            &config.region,
            config.endpoints.sqs.as_deref(),
            &config.http,
            credentials.clone(),
        )?;
        Ok(SqsChannel::new(client, SqsConfig::new(queue)))
    };
    let master_channel = Arc::new(sqs(&config.master_queue)?);
    let worker_channel = Arc::new(sqs(&config.worker_queue)?);

    let autoscaling = ServiceClient::new(
        AwsService::AutoScaling,
        &config.region,
        config.endpoints.autoscaling.as_deref(),
        &config.http,
        credentials.clone(),
    )?;
    let ec2 = ServiceClient::new(
        AwsService::Ec2,
        &config.region,
        config.endpoints.ec2.as_deref(),
        &config.http,
        credentials.clone(),
    )?;

    let services = EpisodeServices {
        role_source: metadata.clone(),
        master_channel,
        worker_channel,
        directory: Arc::new(AwsFleetDirectory::new(autoscaling, ec2)),
        sink: Arc::new(HostFileWriter::new(
            &config,
            Arc::new(NvidiaSmiInventory::new(metadata.clone())),
        )),
        signal: Arc::new(CfnSignal::new(&config, metadata)),
    };

    BootstrapEpisode::new(config, services).run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let loaded = BootstrapConfig::from_env();
    init_logging(loaded.as_ref().ok().and_then(|c| c.log_dir.as_deref()));

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error ({:?}): {}", e.kind(), e);
            return ExitCode::from(e.exit_code());
        }
    };

    info!(
        "Bootstrapping {} node: master queue {}, worker queue {}, stack {}, region {}, budget {:?}",
        config.role,
        config.master_queue,
        config.worker_queue,
        config.stack_id,
        config.region,
        config.available_budget()
    );

    match run(config).await {
        Ok(view) => {
            info!(
                "Bootstrap complete: master {}, workers {:?}",
                view.master(),
                view.workers()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Bootstrap failed ({:?}): {}", e.kind(), e);
            ExitCode::from(e.exit_code())
        }
    }
}
