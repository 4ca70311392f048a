//! virtwatch operator - marks nodes with a silent agent unschedulable and fails
//! the VMs stuck on them

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use virtwatch_common::crd::VirtualMachine;
use virtwatch_common::events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
use virtwatch_common::telemetry::{init_telemetry, TelemetryConfig};
use virtwatch_common::CONTROLLER_NAME;
use virtwatch_node::client::{KubeVirtClient, VirtClient};
use virtwatch_node::config::{
    DEFAULT_FAILURE_EVENT_THRESHOLD, DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_WORKERS,
};
use virtwatch_node::queue::{BackoffConfig, RateLimitedQueue, WorkQueue};
use virtwatch_node::watch::build_watches;
use virtwatch_node::{Context, NodeController, NodeControllerConfig};

/// virtwatch - node heartbeat controller for KubeVirt-style VirtualMachines
#[derive(Parser, Debug)]
#[command(name = "virtwatch-operator", version, about, long_about = None)]
struct Cli {
    /// Print the VirtualMachine CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Seconds without a heartbeat after which a node is unresponsive
    #[arg(long, env = "VIRTWATCH_HEARTBEAT_TIMEOUT_SECS", default_value_t = DEFAULT_HEARTBEAT_TIMEOUT.as_secs())]
    heartbeat_timeout_secs: u64,

    /// Number of parallel reconciliation workers
    #[arg(long, env = "VIRTWATCH_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Only watch VMs and pods in this namespace (default: all namespaces)
    #[arg(long, env = "VIRTWATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Consecutive failures of a node before a Warning Event is published (0 disables)
    #[arg(long, env = "VIRTWATCH_FAILURE_EVENT_THRESHOLD", default_value_t = DEFAULT_FAILURE_EVENT_THRESHOLD)]
    failure_event_threshold: u32,

    /// Retry delay after the first failure of a node, in milliseconds
    #[arg(long, env = "VIRTWATCH_RETRY_INITIAL_DELAY_MS", default_value_t = 1000)]
    retry_initial_delay_ms: u64,

    /// Upper bound for the retry delay, in seconds
    #[arg(long, env = "VIRTWATCH_RETRY_MAX_DELAY_SECS", default_value_t = 300)]
    retry_max_delay_secs: u64,

    /// Human-readable log lines instead of JSON
    #[arg(long, env = "VIRTWATCH_TEXT_LOGS")]
    text_logs: bool,
}

impl Cli {
    fn controller_config(&self) -> anyhow::Result<NodeControllerConfig> {
        anyhow::ensure!(
            self.retry_initial_delay_ms > 0,
            "--retry-initial-delay-ms must be greater than zero"
        );
        anyhow::ensure!(
            self.retry_max_delay_secs > 0,
            "--retry-max-delay-secs must be greater than zero"
        );
        Ok(NodeControllerConfig {
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            workers: self.workers,
            namespace: self.namespace.clone().filter(|ns| !ns.is_empty()),
            failure_event_threshold: self.failure_event_threshold,
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
                max_delay: Duration::from_secs(self.retry_max_delay_secs),
                ..Default::default()
            },
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&VirtualMachine::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let config = cli.controller_config()?;
    init_telemetry(TelemetryConfig {
        service_name: "virtwatch-operator".to_string(),
        json_logs: !cli.text_logs,
        ..Default::default()
    })?;

    run_controller(config).await
}

async fn run_controller(config: NodeControllerConfig) -> anyhow::Result<()> {
    info!(
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        workers = config.effective_workers(),
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        "starting virtwatch node controller"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received, finishing in-flight reconciliations");
            shutdown.cancel();
        });
    }

    let queue: Arc<dyn WorkQueue> = Arc::new(RateLimitedQueue::new(config.backoff.clone()));
    let mut watches = build_watches(
        client.clone(),
        config.namespace.as_deref(),
        queue.clone(),
        shutdown.clone(),
    );
    let watch_handles: Vec<_> = watches.tasks.drain(..).map(tokio::spawn).collect();

    info!("waiting for node and VM caches to sync");
    tokio::select! {
        synced = watches.wait_for_sync() => synced?,
        _ = shutdown.cancelled() => {
            info!("shutdown before caches synced");
            return Ok(());
        }
    }

    let virt_client: Arc<dyn VirtClient> = match &config.namespace {
        Some(ns) => Arc::new(KubeVirtClient::namespaced(client.clone(), ns.clone())),
        None => Arc::new(KubeVirtClient::new(client.clone())),
    };
    let ctx = Arc::new(Context::new(
        virt_client,
        Arc::new(watches.nodes),
        config.heartbeat_timeout,
    ));
    let events: Arc<dyn EventPublisher> = if config.events_enabled() {
        Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME))
    } else {
        info!("failure events disabled");
        Arc::new(NoopEventPublisher)
    };
    let controller = Arc::new(
        NodeController::new(ctx, queue, events)
            .with_failure_event_threshold(config.failure_event_threshold),
    );

    controller
        .run(config.effective_workers(), shutdown.clone())
        .await;

    shutdown.cancel();
    for handle in watch_handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "watch task ended abnormally");
        }
    }
    info!("virtwatch node controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_controller_defaults() {
        let cli = Cli::try_parse_from(["virtwatch-operator"]).expect("no flags is valid");
        let config = cli.controller_config().expect("defaults are valid");
        let defaults = NodeControllerConfig::default();

        assert_eq!(config.heartbeat_timeout, defaults.heartbeat_timeout);
        assert_eq!(config.workers, defaults.workers);
        assert_eq!(config.namespace, None);
        assert_eq!(config.failure_event_threshold, defaults.failure_event_threshold);
        assert_eq!(config.backoff.initial_delay, defaults.backoff.initial_delay);
        assert_eq!(config.backoff.max_delay, defaults.backoff.max_delay);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "virtwatch-operator",
            "--heartbeat-timeout-secs",
            "60",
            "--workers",
            "8",
            "--namespace",
            "vms",
            "--retry-initial-delay-ms",
            "250",
        ])
        .expect("flags are valid");
        let config = cli.controller_config().expect("overrides are valid");

        assert_eq!(config.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.workers, 8);
        assert_eq!(config.namespace.as_deref(), Some("vms"));
        assert_eq!(config.backoff.initial_delay, Duration::from_millis(250));
    }

    #[test]
    fn empty_namespace_means_all() {
        let cli = Cli::try_parse_from(["virtwatch-operator", "--namespace", ""])
            .expect("flags are valid");
        let config = cli.controller_config().expect("empty namespace is valid");
        assert_eq!(config.namespace, None);
    }

    #[test]
    fn zero_retry_delays_are_rejected() {
        let cli = Cli::try_parse_from(["virtwatch-operator", "--retry-initial-delay-ms", "0"])
            .expect("flags parse");
        let err = cli.controller_config().unwrap_err();
        assert!(err.to_string().contains("--retry-initial-delay-ms"));

        let cli = Cli::try_parse_from(["virtwatch-operator", "--retry-max-delay-secs", "0"])
            .expect("flags parse");
        let err = cli.controller_config().unwrap_err();
        assert!(err.to_string().contains("--retry-max-delay-secs"));
    }
}
