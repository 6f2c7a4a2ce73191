/// Phase orchestration and shared provisioning state
use anyhow::{Context as _, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ClusterConfig;
use crate::hcloud::models::{Firewall, LoadBalancer, Network};
use crate::hcloud::InfrastructureManager;
use crate::phases;
use crate::talos::{TalosApi, TalosConfigProducer};

/// Named budgets for every blocking operation.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// TCP probe of the Talos API port
    pub port_wait: Duration,
    /// gRPC channel establishment
    pub dial: Duration,
    /// One node reaching configured mode
    pub node_ready: Duration,
    /// Interval between node-readiness probes
    pub node_ready_poll: Duration,
    /// Kubeconfig retrieval
    pub kubeconfig: Duration,
    /// First wait after server creation before asking for its IP
    pub server_ip_retry_initial: Duration,
    /// Attempts to observe a fresh server's IP (exponential backoff)
    pub server_ip_retry_max_attempts: u32,
    /// Grace period after a config apply before probing the node
    pub reboot_initial_wait: Duration,
    /// Gap between sequential applies through the load balancer
    pub node_reboot_wait: Duration,
    /// Apply retries when the load balancer routes to a configured node
    pub config_apply_retries: u32,
    /// Interval between those retries
    pub config_retry_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            port_wait: Duration::from_secs(5),
            dial: Duration::from_secs(10),
            node_ready: Duration::from_secs(300),
            node_ready_poll: Duration::from_secs(5),
            kubeconfig: Duration::from_secs(120),
            server_ip_retry_initial: Duration::from_secs(1),
            server_ip_retry_max_attempts: 10,
            reboot_initial_wait: Duration::from_secs(10),
            node_reboot_wait: Duration::from_secs(10),
            config_apply_retries: 3,
            config_retry_interval: Duration::from_secs(5),
        }
    }
}

/// Mutable state threaded through the phases. Populated progressively;
/// never persisted — the cloud account itself is the durable store.
#[derive(Default)]
pub struct State {
    pub network: Option<Network>,
    pub firewall: Option<Firewall>,
    pub load_balancer: Option<LoadBalancer>,
    /// Operator's current egress IPv4
    pub public_ip: Option<String>,
    /// Node name → reachable IPv4
    pub control_plane_ips: HashMap<String, String>,
    pub worker_ips: HashMap<String, String>,
    /// Node name → cloud server id
    pub control_plane_server_ids: HashMap<String, i64>,
    pub worker_server_ids: HashMap<String, i64>,
    /// Subject alternative names for the API server certificate
    pub sans: Vec<String>,
    /// Mutual-TLS client config for the Talos API
    pub talos_config: Vec<u8>,
    /// Kubernetes client config
    pub kubeconfig: Vec<u8>,
}

/// Everything a phase needs: the input configuration, the growing state,
/// and the capability handles. No globals.
pub struct Context {
    pub config: ClusterConfig,
    pub state: State,
    pub infra: Arc<dyn InfrastructureManager>,
    pub producer: Arc<dyn TalosConfigProducer>,
    pub talos: Arc<dyn TalosApi>,
    pub timeouts: Timeouts,
    pub cancel: CancellationToken,
}

impl Context {
    pub fn new(
        config: ClusterConfig,
        infra: Arc<dyn InfrastructureManager>,
        producer: Arc<dyn TalosConfigProducer>,
        talos: Arc<dyn TalosApi>,
    ) -> Self {
        Self {
            config,
            state: State::default(),
            infra,
            producer,
            talos,
            timeouts: Timeouts::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// A provisioning phase. Phases are values: a name plus a dispatch arm,
/// no inheritance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validate,
    Infrastructure,
    Compute,
    Bootstrap,
    Destroy,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Validate => "validate",
            Phase::Infrastructure => "infrastructure",
            Phase::Compute => "compute",
            Phase::Bootstrap => "bootstrap",
            Phase::Destroy => "destroy",
        }
    }

    pub async fn provision(&self, ctx: &mut Context) -> Result<()> {
        match self {
            Phase::Validate => phases::validate::run(ctx).await,
            Phase::Infrastructure => phases::infra::run(ctx).await,
            Phase::Compute => phases::compute::run(ctx).await,
            Phase::Bootstrap => phases::bootstrap::run(ctx).await,
            Phase::Destroy => phases::destroy::run(ctx).await,
        }
    }
}

/// Runs phases in order, aggregating timing. The first failure stops the
/// pipeline; already-created resources stay in place for the next
/// invocation to reconcile or for `destroy` to reap.
pub struct Pipeline {
    phases: Vec<Phase>,
}

impl Pipeline {
    /// The `apply` pipeline
    pub fn provision() -> Self {
        Self {
            phases: vec![
                Phase::Validate,
                Phase::Infrastructure,
                Phase::Compute,
                Phase::Bootstrap,
            ],
        }
    }

    /// The `destroy` pipeline
    pub fn destroy() -> Self {
        Self {
            phases: vec![Phase::Destroy],
        }
    }

    pub fn phase_names(&self) -> Vec<&'static str> {
        self.phases.iter().map(Phase::name).collect()
    }

    pub async fn run(&self, ctx: &mut Context) -> Result<()> {
        let total = Instant::now();

        for phase in &self.phases {
            let start = Instant::now();
            info!(phase = phase.name(), "phase.started");

            if let Err(e) = phase.provision(ctx).await {
                error!(phase = phase.name(), error = %e, "phase.failed");
                return Err(e).with_context(|| format!("phase {} failed", phase.name()));
            }

            info!(
                phase = phase.name(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "phase.completed"
            );
        }

        info!(
            elapsed_ms = total.elapsed().as_millis() as u64,
            "pipeline.completed"
        );
        Ok(())
    }
}
