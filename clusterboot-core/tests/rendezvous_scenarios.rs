//! End-to-end rendezvous scenarios over in-process backends
//!
//! Master and workers run full episodes against a shared in-memory channel
//! pair and a static fleet directory, on a paused clock.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clusterboot_core::aws::RoleCredentials;
use clusterboot_core::channel::{InMemoryChannel, MessageChannel};
use clusterboot_core::error::{BootstrapError, Phase};
use clusterboot_core::fleet::{Lifecycle, StaticDirectory};
use clusterboot_core::protocol::{GroupLaunchNotice, MembershipView};
use clusterboot_core::provision::{CompletionSignal, MembershipSink};
use clusterboot_core::worker::RoleCredentialSource;
use clusterboot_core::{BootstrapConfig, BootstrapEpisode, DeadlineBudget, EpisodeServices, Result};

/// Role record available from the first check
struct AttachedRole;

#[async_trait]
impl RoleCredentialSource for AttachedRole {
    async fn role_credentials(&self, _role: &str) -> Result<Option<RoleCredentials>> {
        let record = serde_json::from_value(serde_json::json!({
            "Code": "Success",
            "AccessKeyId": "ASIA",
            "SecretAccessKey": "secret",
            "Token": "token",
        }))
        .unwrap();
        Ok(Some(record))
    }
}

/// Role record never attached
struct MissingRole;

#[async_trait]
impl RoleCredentialSource for MissingRole {
    async fn role_credentials(&self, _role: &str) -> Result<Option<RoleCredentials>> {
        Ok(None)
    }
}

#[derive(Default)]
struct RecordingSink {
    applied: Mutex<Vec<MembershipView>>,
}

#[async_trait]
impl MembershipSink for RecordingSink {
    async fn apply(&self, view: &MembershipView) -> Result<()> {
        self.applied.lock().push(view.clone());
        Ok(())
    }
}

#[derive(Default)]
struct CountingSignal {
    sent: Mutex<u32>,
}

#[async_trait]
impl CompletionSignal for CountingSignal {
    async fn signal_success(&self) -> Result<()> {
        *self.sent.lock() += 1;
        Ok(())
    }
}

struct Cluster {
    master_queue: Arc<InMemoryChannel>,
    worker_queue: Arc<InMemoryChannel>,
    directory: Arc<StaticDirectory>,
}

impl Cluster {
    fn new(page_size: usize) -> Self {
        Self {
            master_queue: Arc::new(InMemoryChannel::new("stack-master")),
            worker_queue: Arc::new(InMemoryChannel::new("stack-worker")),
            directory: Arc::new(StaticDirectory::new(page_size)),
        }
    }

    fn notify(&self, group: &str, launched: u32) {
        self.master_queue
            .push(GroupLaunchNotice::success(group, launched).to_json().unwrap());
    }

    fn episode(
        &self,
        role: &str,
        role_source: Arc<dyn RoleCredentialSource>,
        sink: Arc<RecordingSink>,
        signal: Arc<CountingSignal>,
    ) -> BootstrapEpisode {
        let services = EpisodeServices {
            role_source,
            master_channel: self.master_queue.clone(),
            worker_channel: self.worker_queue.clone(),
            directory: self.directory.clone(),
            sink,
            signal,
        };
        BootstrapEpisode::new(config(role), services)
    }
}

fn config(role: &str) -> BootstrapConfig {
    let env: HashMap<&str, &str> = [
        ("AWS_DL_NODE_TYPE", role),
        ("AWS_DL_MASTER_QUEUE", "stack-master"),
        ("AWS_DL_WORKER_QUEUE", "stack-worker"),
        ("AWS_DL_WAITCONDITION_TIMEOUT", "3600"),
        ("AWS_DL_MASTERLAUNCH_TIMEOUT", "600"),
        ("AWS_DL_STACK_ID", "stack"),
        ("AWS_DL_WAIT_HANDLE", "https://handle"),
        ("AWS_DL_ROLE_NAME", "dl-role"),
        ("AWS_DL_DEFAULT_USER", "ec2-user"),
        ("AWS_REGION", "us-east-1"),
        ("EFS_MOUNT", "/efs"),
        ("CFN_PATH", "/opt/aws/bin"),
    ]
    .into_iter()
    .collect();
    BootstrapConfig::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap()
}

fn ip(raw: &str) -> IpAddr {
    raw.parse().unwrap()
}

fn addresses(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|r| r.to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_three_node_cluster_agrees() {
    let cluster = Cluster::new(10);
    cluster.directory.add_group("stack-MasterAutoScalingGroup-1", &["i-m"]);
    cluster.directory.add_group("stack-WorkerAutoScalingGroup-1", &["i-w1", "i-w2"]);
    cluster.directory.set_member("i-m", Lifecycle::Running, Some(ip("10.0.0.1")));
    cluster.directory.set_member("i-w1", Lifecycle::Running, Some(ip("10.0.0.3")));
    cluster.directory.set_member("i-w2", Lifecycle::Running, Some(ip("10.0.0.2")));
    cluster.notify("stack-WorkerAutoScalingGroup-1", 2);
    cluster.notify("stack-MasterAutoScalingGroup-1", 1);

    let master_sink = Arc::new(RecordingSink::default());
    let signal = Arc::new(CountingSignal::default());
    let master = cluster.episode("master", Arc::new(AttachedRole), master_sink.clone(), signal.clone());

    let worker_sinks: Vec<Arc<RecordingSink>> = (0..2).map(|_| Arc::new(RecordingSink::default())).collect();
    let workers: Vec<BootstrapEpisode> = worker_sinks
        .iter()
        .map(|sink| {
            cluster.episode(
                "worker",
                Arc::new(AttachedRole),
                sink.clone(),
                Arc::new(CountingSignal::default()),
            )
        })
        .collect();

    let (master_view, first, second) = tokio::join!(master.run(), workers[0].run(), workers[1].run());
    let master_view = master_view.unwrap();

    assert_eq!(master_view.master(), "10.0.0.1");
    assert_eq!(master_view.workers(), addresses(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]).as_slice());
    assert_eq!(first.unwrap(), master_view);
    assert_eq!(second.unwrap(), master_view);

    assert_eq!(master_sink.applied.lock().as_slice(), &[master_view.clone()]);
    for sink in &worker_sinks {
        assert_eq!(sink.applied.lock().as_slice(), &[master_view.clone()]);
    }
    assert_eq!(*signal.sent.lock(), 1);
    assert_eq!(cluster.worker_queue.len(), 1);
    assert!(cluster.master_queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_notices_do_not_change_outcome() {
    let cluster = Cluster::new(10);
    cluster.directory.add_group("s-MasterASG", &["i-m"]);
    cluster.directory.add_group("s-WorkerASG", &["i-w"]);
    cluster.directory.set_member("i-m", Lifecycle::Running, Some(ip("10.0.0.1")));
    cluster.directory.set_member("i-w", Lifecycle::Running, Some(ip("10.0.0.2")));
    for _ in 0..4 {
        cluster.notify("s-WorkerASG", 1);
    }
    cluster.notify("s-MasterASG", 1);
    cluster.notify("s-MasterASG", 1);

    let sink = Arc::new(RecordingSink::default());
    let view = cluster
        .episode("master", Arc::new(AttachedRole), sink, Arc::new(CountingSignal::default()))
        .run()
        .await
        .unwrap();

    assert_eq!(view.workers(), addresses(&["10.0.0.1", "10.0.0.2"]).as_slice());
    assert_eq!(cluster.worker_queue.len(), 1);
    assert!(cluster.master_queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_late_notices_and_pending_members() {
    let cluster = Cluster::new(10);
    cluster.directory.add_group("s-MasterASG", &["i-m"]);
    cluster.directory.add_group("s-WorkerASG", &["i-w"]);
    cluster.directory.set_member("i-m", Lifecycle::Running, Some(ip("10.0.0.1")));
    cluster.directory.set_member("i-w", Lifecycle::Pending, None);
    cluster.notify("s-MasterASG", 1);

    let fleet = {
        let master_queue = cluster.master_queue.clone();
        let directory = cluster.directory.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            master_queue.push(GroupLaunchNotice::success("s-WorkerASG", 1).to_json().unwrap());
            tokio::time::sleep(Duration::from_secs(60)).await;
            directory.set_member("i-w", Lifecycle::Running, Some(ip("10.0.0.7")));
        }
    };

    let episode = cluster.episode(
        "master",
        Arc::new(AttachedRole),
        Arc::new(RecordingSink::default()),
        Arc::new(CountingSignal::default()),
    );
    let started = tokio::time::Instant::now();
    let (view, _) = tokio::join!(episode.run(), fleet);
    let view = view.unwrap();

    assert_eq!(view.workers(), addresses(&["10.0.0.1", "10.0.0.7"]).as_slice());
    // notice seen at 60s, member running at 105s, next poll at 120s
    assert_eq!(started.elapsed(), Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn test_paginated_directory_resolves_large_group() {
    let cluster = Cluster::new(3);
    cluster.directory.add_group("s-MasterASG", &["i-m"]);
    let worker_ids: Vec<String> = (1..=10).map(|i| format!("i-w{:02}", i)).collect();
    let worker_refs: Vec<&str> = worker_ids.iter().map(String::as_str).collect();
    cluster.directory.add_group("s-WorkerASG", &worker_refs);
    cluster.directory.set_member("i-m", Lifecycle::Running, Some(ip("10.0.1.1")));
    for (i, id) in worker_ids.iter().enumerate() {
        cluster
            .directory
            .set_member(id, Lifecycle::Running, Some(ip(&format!("10.0.2.{}", 10 - i))));
    }
    cluster.notify("s-MasterASG", 1);
    cluster.notify("s-WorkerASG", 10);

    let started = tokio::time::Instant::now();
    let view = cluster
        .episode(
            "master",
            Arc::new(AttachedRole),
            Arc::new(RecordingSink::default()),
            Arc::new(CountingSignal::default()),
        )
        .run()
        .await
        .unwrap();

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(cluster.directory.describe_calls(), 4);
    assert_eq!(view.workers().len(), 11);
    assert!(view.workers().windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_stays_visible_to_every_reader() {
    let cluster = Cluster::new(10);
    let view = MembershipView::with_master_as_worker("10.0.0.1", addresses(&["10.0.0.2"]));
    cluster.worker_queue.push(view.to_json().unwrap());

    for _ in 0..3 {
        let episode = cluster.episode(
            "worker",
            Arc::new(AttachedRole),
            Arc::new(RecordingSink::default()),
            Arc::new(CountingSignal::default()),
        );
        assert_eq!(episode.run().await.unwrap(), view);
    }

    let remaining = cluster.worker_queue.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(remaining.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_worker_times_out_without_broadcast() {
    let cluster = Cluster::new(10);
    let sink = Arc::new(RecordingSink::default());
    let episode = cluster.episode("worker", Arc::new(AttachedRole), sink.clone(), Arc::new(CountingSignal::default()));

    let started = tokio::time::Instant::now();
    let err = episode
        .run_with_budget(&DeadlineBudget::new(Duration::from_secs(5)))
        .await
        .unwrap_err();

    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert!(matches!(err, BootstrapError::Timeout { phase: Phase::BroadcastWait, .. }));
    assert_eq!(err.exit_code(), 1);
    assert!(sink.applied.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_master_times_out_waiting_for_notices() {
    let cluster = Cluster::new(10);
    let signal = Arc::new(CountingSignal::default());
    let episode = cluster.episode("master", Arc::new(AttachedRole), Arc::new(RecordingSink::default()), signal.clone());

    let started = tokio::time::Instant::now();
    let err = episode
        .run_with_budget(&DeadlineBudget::new(Duration::from_secs(5)))
        .await
        .unwrap_err();

    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert!(matches!(err, BootstrapError::Timeout { phase: Phase::LaunchWatch, .. }));
    assert_eq!(*signal.sent.lock(), 0);
    assert!(cluster.worker_queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_role_is_fatal() {
    let cluster = Cluster::new(10);
    let episode = cluster.episode(
        "worker",
        Arc::new(MissingRole),
        Arc::new(RecordingSink::default()),
        Arc::new(CountingSignal::default()),
    );

    let err = episode
        .run_with_budget(&DeadlineBudget::new(Duration::from_secs(90)))
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::RoleUnavailable { .. }));
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_master_count_mismatch_is_not_retried() {
    let cluster = Cluster::new(10);
    cluster.directory.add_group("s-MasterASG", &[]);
    cluster.directory.add_group("s-WorkerASG", &["i-w"]);
    cluster.directory.set_member("i-w", Lifecycle::Running, Some(ip("10.0.0.2")));
    cluster.notify("s-MasterASG", 1);
    cluster.notify("s-WorkerASG", 1);

    let started = tokio::time::Instant::now();
    let err = cluster
        .episode(
            "master",
            Arc::new(AttachedRole),
            Arc::new(RecordingSink::default()),
            Arc::new(CountingSignal::default()),
        )
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, BootstrapError::MasterCountMismatch { count: 0 }));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(cluster.worker_queue.is_empty());
}
