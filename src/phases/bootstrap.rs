/// Cluster bootstrap state machine
///
/// Fresh nodes serve the Talos API in maintenance mode (any TLS client,
/// restricted RPCs). Applying a machine config reboots them into
/// configured mode (mutual TLS only). This phase drives that transition
/// for every node, initializes etcd exactly once per cluster lifetime,
/// and fetches the kubeconfig.
///
/// Whether etcd was ever initialized is recorded in the cloud account
/// itself: a throwaway certificate named `<cluster>-state`. Present
/// means bootstrapped; the scale-out path then only configures nodes
/// still in maintenance mode.
use anyhow::{Context as _, Result};
use futures::future::join_all;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::ClusterAccess;
use crate::pipeline::Context;
use crate::talos::api::{is_maintenance_signal, is_tls_class_error};
use crate::utils::polling::PollingConfig;

pub async fn run(ctx: &mut Context) -> Result<()> {
    if ctx.state.control_plane_ips.is_empty() {
        warn!("No control plane nodes in state, nothing to bootstrap");
        return Ok(());
    }

    if ctx.state.talos_config.is_empty() {
        ctx.state.talos_config = ctx
            .producer
            .client_config()
            .await
            .context("failed to obtain Talos client config")?;
    }

    let marker_name = format!("{}-state", ctx.config.cluster_name);
    let initialized = ctx.infra.get_certificate(&marker_name).await?.is_some();

    if initialized {
        scale_out(ctx).await
    } else {
        fresh_bootstrap(ctx, &marker_name).await
    }
}

/// First bootstrap of this cluster: configure everything, initialize
/// etcd on one node, record the marker, fetch the kubeconfig.
async fn fresh_bootstrap(ctx: &mut Context, marker_name: &str) -> Result<()> {
    let control_planes = sorted_nodes(&ctx.state.control_plane_ips);
    configure_control_planes(ctx, &control_planes).await?;

    let (first_name, first_ip) = control_planes
        .first()
        .context("no control plane nodes available for etcd bootstrap")?;
    let endpoint = control_plane_endpoint(ctx, first_ip)?;
    info!("Bootstrapping etcd on {} ({})", first_name, endpoint);
    ctx.talos
        .bootstrap(&endpoint, &ctx.state.talos_config)
        .await
        .with_context(|| format!("etcd bootstrap on {} failed", first_name))?;

    write_state_marker(ctx, marker_name).await?;

    let workers = sorted_nodes(&ctx.state.worker_ips);
    configure_workers(ctx, &workers).await?;

    ctx.state.kubeconfig = retrieve_kubeconfig(ctx).await?;
    info!("Cluster {} bootstrapped", ctx.config.cluster_name);
    Ok(())
}

/// The cluster is already initialized: find nodes that are still in
/// maintenance mode (added since the last run) and configure only those.
async fn scale_out(ctx: &mut Context) -> Result<()> {
    info!("Cluster already initialized, reconciling newly added nodes");

    let mut new_control_planes = Vec::new();
    for (name, ip) in sorted_nodes(&ctx.state.control_plane_ips) {
        if is_in_maintenance_mode(ctx, &ip).await {
            info!("Control plane {} is unconfigured", name);
            new_control_planes.push((name, ip));
        }
    }

    let mut new_workers = Vec::new();
    for (name, ip) in sorted_nodes(&ctx.state.worker_ips) {
        if is_in_maintenance_mode(ctx, &ip).await {
            info!("Worker {} is unconfigured", name);
            new_workers.push((name, ip));
        }
    }

    if new_control_planes.is_empty() && new_workers.is_empty() {
        info!("No unconfigured nodes found");
    } else {
        configure_control_planes(ctx, &new_control_planes).await?;
        configure_workers(ctx, &new_workers).await?;
    }

    // The reconcile already succeeded; a stale kubeconfig is not worth
    // failing the run over.
    match retrieve_kubeconfig(ctx).await {
        Ok(kubeconfig) => ctx.state.kubeconfig = kubeconfig,
        Err(e) => warn!("Could not refresh kubeconfig: {}", e),
    }

    Ok(())
}

/// Decide whether a node still serves the maintenance-mode API.
///
/// An unreachable port means offline or still booting, not maintenance.
/// A successful authenticated `Version` means already configured, even
/// if an insecure call would also succeed. Only then does the insecure
/// probe decide: success or the maintenance-mode protocol signal both
/// identify an unconfigured node.
pub async fn is_in_maintenance_mode(ctx: &Context, ip: &str) -> bool {
    if !ctx.talos.probe_port(ip, ctx.timeouts.port_wait).await {
        return false;
    }

    if ctx.state.talos_config.is_empty() {
        warn!("No Talos client config available, treating {} as configured", ip);
        return false;
    }

    if ctx
        .talos
        .version_authenticated(ip, &ctx.state.talos_config)
        .await
        .is_ok()
    {
        return false;
    }

    match ctx.talos.version_insecure(ip).await {
        Ok(()) => true,
        Err(e) => is_maintenance_signal(&format!("{:#}", e)),
    }
}

/// Apply machine configs to control planes and wait until they answer
/// authenticated `Version` calls.
async fn configure_control_planes(ctx: &Context, nodes: &[(String, String)]) -> Result<()> {
    if nodes.is_empty() {
        return Ok(());
    }

    match ctx.config.cluster_access {
        ClusterAccess::Public => configure_control_planes_direct(ctx, nodes).await,
        ClusterAccess::Private => configure_control_planes_via_lb(ctx, nodes).await,
    }
}

/// Public access: every node is reachable directly, so applies are
/// order-independent and run in parallel.
async fn configure_control_planes_direct(ctx: &Context, nodes: &[(String, String)]) -> Result<()> {
    let applies = nodes.iter().map(|(name, ip)| async move {
        let config = generate_control_plane_config(ctx, name).await?;
        info!("Applying control plane config to {} ({})", name, ip);
        ctx.talos
            .apply_configuration(ip, &config)
            .await
            .with_context(|| format!("failed to apply config to {}", name))
    });
    collect_errors(join_all(applies).await)?;

    let waits = nodes
        .iter()
        .map(|(name, ip)| wait_for_node_ready(ctx, name, ip));
    collect_errors(join_all(waits).await)
}

/// Private access: nodes are only reachable through the load balancer
/// VIP, which cannot distinguish targets. Each apply reboots its target
/// out of the maintenance pool, so applies run strictly sequentially
/// with a settling gap. When the VIP routes to a node that is already
/// configured, the apply fails at the TLS layer and is retried.
async fn configure_control_planes_via_lb(ctx: &Context, nodes: &[(String, String)]) -> Result<()> {
    let vip = load_balancer_vip(ctx)?;

    for (i, (name, _)) in nodes.iter().enumerate() {
        let config = generate_control_plane_config(ctx, name).await?;
        info!("Applying control plane config for {} via {}", name, vip);
        apply_with_retries(ctx, &vip, &config, name).await?;

        if i + 1 < nodes.len() {
            tokio::time::sleep(ctx.timeouts.node_reboot_wait).await;
        }
    }

    // A single authenticated answer through the VIP proves quorum
    // exists; individual nodes cannot be addressed anyway.
    tokio::time::sleep(ctx.timeouts.reboot_initial_wait).await;
    let budget = ctx.timeouts.node_ready * nodes.len() as u32;
    let poll = PollingConfig::new(
        budget,
        ctx.timeouts.node_ready_poll,
        "node to be ready".to_string(),
    );
    let vip = &vip;
    poll.poll_until(&ctx.cancel, || async move {
        Ok(ctx
            .talos
            .version_authenticated(vip, &ctx.state.talos_config)
            .await
            .is_ok())
    })
    .await
}

async fn apply_with_retries(ctx: &Context, vip: &str, config: &[u8], node: &str) -> Result<()> {
    let attempts = ctx.timeouts.config_apply_retries.max(1);

    for attempt in 1..=attempts {
        match ctx.talos.apply_configuration(vip, config).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                let message = format!("{:#}", e);
                if is_tls_class_error(&message) && attempt < attempts {
                    info!(
                        "Load balancer routed to a configured node, retrying {} ({}/{})",
                        node, attempt, attempts
                    );
                    tokio::time::sleep(ctx.timeouts.config_retry_interval).await;
                } else {
                    return Err(e).with_context(|| format!("failed to apply config for {}", node));
                }
            }
        }
    }

    anyhow::bail!(
        "failed to apply config for {} after {} attempts",
        node,
        attempts
    )
}

/// Workers are configured pool by pool; nodes within a pool in parallel.
async fn configure_workers(ctx: &Context, nodes: &[(String, String)]) -> Result<()> {
    if nodes.is_empty() {
        return Ok(());
    }

    for pool in &ctx.config.workers {
        let prefix = format!("{}-{}-", ctx.config.cluster_name, pool.name);
        let pool_nodes: Vec<&(String, String)> = nodes
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .collect();
        if pool_nodes.is_empty() {
            continue;
        }

        let applies = pool_nodes.iter().map(|(name, ip)| async move {
            let config = ctx
                .producer
                .generate_worker_config(name, server_id(ctx, name)?)
                .await
                .with_context(|| format!("failed to generate config for {}", name))?;
            info!("Applying worker config to {} ({})", name, ip);
            ctx.talos
                .apply_configuration(ip, &config)
                .await
                .with_context(|| format!("failed to apply config to {}", name))
        });
        collect_errors(join_all(applies).await)?;

        let waits = pool_nodes
            .iter()
            .map(|(name, ip)| wait_for_node_ready(ctx, name, ip));
        collect_errors(join_all(waits).await)?;
    }

    Ok(())
}

/// Sleep out the reboot, wait for the port, then for an authenticated
/// `Version` answer.
async fn wait_for_node_ready(ctx: &Context, name: &str, ip: &str) -> Result<()> {
    tokio::time::sleep(ctx.timeouts.reboot_initial_wait).await;

    let endpoint = match ctx.config.cluster_access {
        ClusterAccess::Public => ip.to_string(),
        ClusterAccess::Private => load_balancer_vip(ctx)?,
    };

    let poll = PollingConfig::new(
        ctx.timeouts.node_ready,
        ctx.timeouts.node_ready_poll,
        format!("node {} to be ready", name),
    );
    poll.poll_until(&ctx.cancel, || {
        let endpoint = endpoint.clone();
        async move {
            if !ctx.talos.probe_port(&endpoint, ctx.timeouts.port_wait).await {
                return Ok(false);
            }
            Ok(ctx
                .talos
                .version_authenticated(&endpoint, &ctx.state.talos_config)
                .await
                .is_ok())
        }
    })
    .await
}

/// Poll for a non-empty kubeconfig from a control plane.
async fn retrieve_kubeconfig(ctx: &Context) -> Result<Vec<u8>> {
    let control_planes = sorted_nodes(&ctx.state.control_plane_ips);
    let (_, first_ip) = control_planes
        .first()
        .context("no control plane nodes available for kubeconfig retrieval")?;
    let endpoint = control_plane_endpoint(ctx, first_ip)?;

    let poll = PollingConfig::new(
        ctx.timeouts.kubeconfig,
        ctx.timeouts.node_ready_poll,
        "Kubernetes API to be ready".to_string(),
    );
    let endpoint = &endpoint;
    poll.poll(&ctx.cancel, || async move {
        match ctx.talos.kubeconfig(endpoint, &ctx.state.talos_config).await {
            Ok(kubeconfig) if !kubeconfig.is_empty() => Ok(Some(kubeconfig)),
            Ok(_) | Err(_) => Ok(None),
        }
    })
    .await
}

/// Record "etcd has been initialized" as a labeled certificate resource.
/// The cloud offers no generic key-value store; a throwaway self-signed
/// certificate is the cheapest labeled resource. Its contents are never
/// used.
async fn write_state_marker(ctx: &Context, marker_name: &str) -> Result<()> {
    let certified = rcgen::generate_simple_self_signed(vec![marker_name.to_string()])
        .context("failed to generate state marker certificate")?;

    let mut labels = ctx.config.base_labels();
    labels.insert("state".to_string(), "initialized".to_string());

    ctx.infra
        .ensure_certificate(
            marker_name,
            &certified.cert.pem(),
            &certified.key_pair.serialize_pem(),
            &labels,
        )
        .await
        .context("failed to write cluster state marker")?;

    info!("Cluster state marker {} written", marker_name);
    Ok(())
}

async fn generate_control_plane_config(ctx: &Context, name: &str) -> Result<Vec<u8>> {
    ctx.producer
        .generate_control_plane_config(&ctx.state.sans, name, server_id(ctx, name)?)
        .await
        .with_context(|| format!("failed to generate config for {}", name))
}

fn server_id(ctx: &Context, name: &str) -> Result<i64> {
    ctx.state
        .control_plane_server_ids
        .get(name)
        .or_else(|| ctx.state.worker_server_ids.get(name))
        .copied()
        .with_context(|| format!("no server id recorded for {}", name))
}

/// Talos endpoint for control-plane operations: the node itself in
/// public clusters, the load balancer VIP in private ones.
fn control_plane_endpoint(ctx: &Context, node_ip: &str) -> Result<String> {
    match ctx.config.cluster_access {
        ClusterAccess::Public => Ok(node_ip.to_string()),
        ClusterAccess::Private => load_balancer_vip(ctx),
    }
}

fn load_balancer_vip(ctx: &Context) -> Result<String> {
    ctx.state
        .load_balancer
        .as_ref()
        .and_then(|lb| lb.public_ipv4())
        .context("private cluster access requires a load balancer with a public IPv4")
}

fn sorted_nodes(map: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut nodes: Vec<(String, String)> =
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    nodes.sort();
    nodes
}

fn collect_errors(results: Vec<Result<()>>) -> Result<()> {
    let errors: Vec<String> = results
        .into_iter()
        .filter_map(|result| result.err())
        .map(|e| format!("{:#}", e))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{}", errors.join("; "))
    }
}
