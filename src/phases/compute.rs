/// Compute phase: node-pool reconciliation
use anyhow::{Context as _, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodePool;
use crate::hcloud::models::Architecture;
use crate::hcloud::{CreateServerOpts, InfrastructureManager};
use crate::net::{placement_shard, SubnetLayout};
use crate::pipeline::{Context, Timeouts};
use crate::rdns;

/// Node role in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::ControlPlane => write!(f, "control-plane"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

/// Everything a per-node task needs, cheaply cloneable
#[derive(Clone)]
struct PoolContext {
    infra: Arc<dyn InfrastructureManager>,
    cancel: CancellationToken,
    timeouts: Timeouts,
    cluster_name: String,
    base_labels: HashMap<String, String>,
    default_location: String,
    talos_version: String,
    kubernetes_version: String,
    network_id: i64,
    ssh_keys: Vec<String>,
    rdns_template: Option<String>,
}

/// Pre-computed per-node configuration
#[derive(Debug, Clone)]
struct NodePlan {
    name: String,
    private_ip: String,
    placement_group: Option<i64>,
}

pub async fn run(ctx: &mut Context) -> Result<()> {
    let network_id = ctx
        .state
        .network
        .as_ref()
        .context("network must be ensured before compute")?
        .id;
    let layout = *ctx.config.subnets()?;

    let (ssh_keys, ephemeral_key) = ensure_ssh_keys(ctx).await?;

    let shared = PoolContext {
        infra: ctx.infra.clone(),
        cancel: ctx.cancel.clone(),
        timeouts: ctx.timeouts.clone(),
        cluster_name: ctx.config.cluster_name.clone(),
        base_labels: ctx.config.base_labels(),
        default_location: ctx.config.hcloud.location.clone(),
        talos_version: ctx.config.talos.version.clone(),
        kubernetes_version: ctx.config.talos.kubernetes_version.clone(),
        network_id,
        ssh_keys,
        rdns_template: ctx.config.rdns.as_ref().and_then(|r| r.server_template.clone()),
    };

    // Control-plane pools run one after another; their nodes in parallel.
    let control_plane_pools = ctx.config.control_planes.clone();
    for (pool_index, pool) in control_plane_pools.iter().enumerate() {
        let plans = plan_control_plane_pool(&shared, &layout, pool_index, pool).await?;
        let (ips, ids) = reconcile_node_pool(&shared, pool, NodeRole::ControlPlane, plans).await?;
        ctx.state.control_plane_ips.extend(ips);
        ctx.state.control_plane_server_ids.extend(ids);
    }

    // Worker pools are independent of each other and run in parallel.
    let worker_pools = ctx.config.workers.clone();
    let tasks = worker_pools.iter().enumerate().map(|(pool_index, pool)| {
        let shared = shared.clone();
        async move {
            let plans = plan_worker_pool(&shared, &layout, pool_index, pool).await?;
            reconcile_node_pool(&shared, pool, NodeRole::Worker, plans).await
        }
    });

    let mut errors = Vec::new();
    for result in join_all(tasks).await {
        match result {
            Ok((ips, ids)) => {
                ctx.state.worker_ips.extend(ips);
                ctx.state.worker_server_ids.extend(ids);
            }
            Err(e) => errors.push(e.to_string()),
        }
    }
    if !errors.is_empty() {
        anyhow::bail!("worker provisioning failed: {}", errors.join("; "));
    }

    // Hand-off to bootstrap: the API certificate must cover every address
    // the cluster is reached through.
    if let Some(lb) = &ctx.state.load_balancer {
        let mut sans = Vec::new();
        if let Some(public) = lb.public_ipv4() {
            sans.push(public);
        }
        sans.extend(lb.private_ipv4s());
        ctx.state.sans = sans;
    }

    if let Some(name) = ephemeral_key {
        if let Err(e) = ctx.infra.delete_ssh_key(&name).await {
            warn!("Could not delete ephemeral SSH key {}: {}", name, e);
        }
    }

    Ok(())
}

/// Use the configured SSH keys, or generate a throwaway one so server
/// creation does not trigger root-password mails. Returns the key names
/// plus the ephemeral key name when one was created.
async fn ensure_ssh_keys(ctx: &Context) -> Result<(Vec<String>, Option<String>)> {
    if !ctx.config.ssh_keys.is_empty() {
        return Ok((ctx.config.ssh_keys.clone(), None));
    }

    let name = format!("{}-provision", ctx.config.cluster_name);
    let public_key = generate_ed25519_public_key();
    ctx.infra
        .ensure_ssh_key(&name, &public_key, &ctx.config.base_labels())
        .await?;
    Ok((vec![name.clone()], Some(name)))
}

/// All control-plane nodes of a pool share one spread placement group.
async fn plan_control_plane_pool(
    shared: &PoolContext,
    layout: &SubnetLayout,
    pool_index: usize,
    pool: &NodePool,
) -> Result<Vec<NodePlan>> {
    if pool.count == 0 {
        return Ok(Vec::new());
    }

    let pg_name = format!("{}-{}-pg", shared.cluster_name, pool.name);
    let pg = shared
        .infra
        .ensure_placement_group(&pg_name, &shared.base_labels)
        .await?;

    Ok((1..=pool.count)
        .map(|node_index| NodePlan {
            name: node_name(&shared.cluster_name, &pool.name, node_index),
            private_ip: layout.control_plane_ip(pool_index, node_index).to_string(),
            placement_group: Some(pg.id),
        })
        .collect())
}

/// Worker pools either use no placement group, or shard one per ten
/// nodes so large pools stay placeable.
async fn plan_worker_pool(
    shared: &PoolContext,
    layout: &SubnetLayout,
    pool_index: usize,
    pool: &NodePool,
) -> Result<Vec<NodePlan>> {
    let mut shard_ids: HashMap<u32, i64> = HashMap::new();
    if pool.placement_group {
        for node_index in 1..=pool.count {
            let shard = placement_shard(node_index);
            if !shard_ids.contains_key(&shard) {
                let pg_name = format!("{}-{}-pg-{}", shared.cluster_name, pool.name, shard);
                let pg = shared
                    .infra
                    .ensure_placement_group(&pg_name, &shared.base_labels)
                    .await?;
                shard_ids.insert(shard, pg.id);
            }
        }
    }

    (1..=pool.count)
        .map(|node_index| {
            Ok(NodePlan {
                name: node_name(&shared.cluster_name, &pool.name, node_index),
                private_ip: layout.worker_ip(pool_index, node_index)?.to_string(),
                placement_group: pool
                    .placement_group
                    .then(|| shard_ids[&placement_shard(node_index)]),
            })
        })
        .collect()
}

/// Stable, unique node name: `<cluster>-<pool>-<index>` with a 1-based
/// index.
fn node_name(cluster: &str, pool: &str, node_index: u32) -> String {
    format!("{}-{}-{}", cluster, pool, node_index)
}

/// Run up to `count` concurrent ensure-server tasks. Results land in the
/// shared maps under a mutex; a failing task does not cancel its peers,
/// and all errors are aggregated with the pool name prefixed.
async fn reconcile_node_pool(
    shared: &PoolContext,
    pool: &NodePool,
    role: NodeRole,
    plans: Vec<NodePlan>,
) -> Result<(HashMap<String, String>, HashMap<String, i64>)> {
    let ips = Arc::new(Mutex::new(HashMap::new()));
    let server_ids = Arc::new(Mutex::new(HashMap::new()));

    let tasks = plans.into_iter().map(|plan| {
        let shared = shared.clone();
        let pool = pool.clone();
        let ips = ips.clone();
        let server_ids = server_ids.clone();
        async move {
            if shared.cancel.is_cancelled() {
                anyhow::bail!("{}: cancelled before provisioning started", plan.name);
            }
            let (ip, server_id) = ensure_server(&shared, &pool, role, &plan)
                .await
                .with_context(|| plan.name.clone())?;
            ips.lock().await.insert(plan.name.clone(), ip);
            server_ids.lock().await.insert(plan.name, server_id);
            Ok(())
        }
    });

    let errors: Vec<String> = join_all(tasks)
        .await
        .into_iter()
        .filter_map(|result| result.err())
        .map(|e| format!("{:#}", e))
        .collect();

    if !errors.is_empty() {
        anyhow::bail!("pool {}: {}", pool.name, errors.join("; "));
    }

    let ips = Arc::try_unwrap(ips)
        .map_err(|_| anyhow::anyhow!("pool tasks still hold the IP map"))?
        .into_inner();
    let server_ids = Arc::try_unwrap(server_ids)
        .map_err(|_| anyhow::anyhow!("pool tasks still hold the server-id map"))?
        .into_inner();

    Ok((ips, server_ids))
}

/// Idempotent server provisioning: reuse by name, otherwise create and
/// wait until the cloud reports an address.
async fn ensure_server(
    shared: &PoolContext,
    pool: &NodePool,
    role: NodeRole,
    plan: &NodePlan,
) -> Result<(String, i64)> {
    if let Some(ip) = shared.infra.get_server_ip(&plan.name).await? {
        if !ip.is_empty() {
            let server_id = shared
                .infra
                .get_server_id(&plan.name)
                .await?
                .with_context(|| format!("server {} has an IP but no ID", plan.name))?;
            debug!("Server {} already exists at {}", plan.name, ip);
            return Ok((ip, server_id));
        }
    }

    let image = resolve_image(shared, pool).await?;

    let mut labels = shared.base_labels.clone();
    labels.extend(pool.labels.clone());
    labels.insert("role".to_string(), role.to_string());
    labels.insert("pool".to_string(), pool.name.clone());

    let (enable_public_ipv4, enable_public_ipv6) = pool.public_net();
    let location = pool
        .location
        .clone()
        .unwrap_or_else(|| shared.default_location.clone());

    let created_id = shared
        .infra
        .create_server(CreateServerOpts {
            name: plan.name.clone(),
            server_type: pool.server_type.clone(),
            location,
            image,
            ssh_keys: shared.ssh_keys.clone(),
            labels,
            user_data: None,
            placement_group: plan.placement_group,
            network_id: shared.network_id,
            private_ip: plan.private_ip.clone(),
            enable_public_ipv4,
            enable_public_ipv6,
        })
        .await?;

    let ip = wait_for_server_ip(shared, &plan.name).await?;
    info!("Server {} is up at {}", plan.name, ip);

    // The create response predates network attachment; the fetched
    // record is authoritative.
    let server_id = shared
        .infra
        .get_server_id(&plan.name)
        .await?
        .unwrap_or(created_id);

    if let Some(template) = &shared.rdns_template {
        let vars = rdns::RdnsVars::new(&shared.cluster_name, &plan.name, &ip);
        match rdns::render(template, &vars) {
            Ok(ptr) => {
                if let Err(e) = shared.infra.set_server_rdns(server_id, &ip, &ptr).await {
                    warn!("Could not set reverse DNS for {}: {}", plan.name, e);
                }
            }
            Err(e) => warn!("Could not render reverse DNS template for {}: {}", plan.name, e),
        }
    }

    Ok((ip, server_id))
}

/// Poll for a fresh server's address with exponential backoff.
async fn wait_for_server_ip(shared: &PoolContext, name: &str) -> Result<String> {
    let mut delay = shared.timeouts.server_ip_retry_initial;

    for _ in 0..shared.timeouts.server_ip_retry_max_attempts {
        if shared.cancel.is_cancelled() {
            anyhow::bail!("cancelled while waiting for {}", name);
        }

        if let Some(ip) = shared.infra.get_server_ip(name).await? {
            if !ip.is_empty() {
                return Ok(ip);
            }
        }

        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(std::time::Duration::from_secs(30));
    }

    anyhow::bail!("timeout waiting for {} to report an address", name)
}

/// The base OS image is a pre-built snapshot discovered by labels; the
/// architecture follows from the server type.
async fn resolve_image(shared: &PoolContext, pool: &NodePool) -> Result<String> {
    if let Some(image) = &pool.image {
        return Ok(image.clone());
    }

    let arch = Architecture::from_server_type(&pool.server_type);
    let labels = HashMap::from([
        ("os".to_string(), "talos".to_string()),
        ("talos-version".to_string(), shared.talos_version.clone()),
        ("k8s-version".to_string(), shared.kubernetes_version.clone()),
        ("arch".to_string(), arch.to_string()),
    ]);

    let snapshot = shared
        .infra
        .get_snapshot_by_labels(&labels)
        .await?
        .with_context(|| {
            format!(
                "snapshot not found (os=talos, talos-version={}, k8s-version={}, arch={}), should have been pre-built",
                shared.talos_version, shared.kubernetes_version, arch
            )
        })?;

    Ok(snapshot.id.to_string())
}

/// OpenSSH-format ED25519 public key for the ephemeral provisioning key.
/// The private half is never used and never stored.
fn generate_ed25519_public_key() -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();

    let key_type = b"ssh-ed25519";
    let key_bytes = verifying_key.as_bytes();

    let mut wire_format = Vec::new();
    wire_format.extend_from_slice(&(key_type.len() as u32).to_be_bytes());
    wire_format.extend_from_slice(key_type);
    wire_format.extend_from_slice(&(key_bytes.len() as u32).to_be_bytes());
    wire_format.extend_from_slice(key_bytes);

    format!("ssh-ed25519 {}", STANDARD.encode(wire_format))
}
