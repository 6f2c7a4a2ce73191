/// Infrastructure phase: network, firewall, load balancer
use anyhow::{Context as _, Result};
use tracing::{debug, info, warn};

use crate::config::FirewallConfig;
use crate::hcloud::models::{FirewallRule, HealthCheck, HttpHealthCheck, LoadBalancerService};
use crate::pipeline::Context;
use crate::rdns;
use crate::talos::TALOS_API_PORT;

const KUBE_API_PORT: u16 = 6443;
const LOAD_BALANCER_TYPE: &str = "lb11";

pub async fn run(ctx: &mut Context) -> Result<()> {
    ensure_network(ctx).await?;
    ensure_firewall(ctx).await?;
    ensure_load_balancer(ctx).await?;
    Ok(())
}

/// Private network with one leaf subnet per role. The worker parent CIDR
/// is an address reservation only and never becomes a cloud subnet.
async fn ensure_network(ctx: &mut Context) -> Result<()> {
    let layout = *ctx.config.subnets()?;
    let name = format!("{}-network", ctx.config.cluster_name);
    let zone = ctx.config.hcloud.network.zone.clone();

    let network = ctx
        .infra
        .ensure_network(&name, &ctx.config.hcloud.network.cidr, &ctx.config.base_labels())
        .await?;

    ctx.infra
        .ensure_subnet(&network, &layout.load_balancer.to_string(), &zone)
        .await?;
    ctx.infra
        .ensure_subnet(&network, &layout.control_plane.to_string(), &zone)
        .await?;
    for pool_index in 0..ctx.config.workers.len() {
        let subnet = layout.worker_pool_subnet(pool_index)?;
        ctx.infra
            .ensure_subnet(&network, &subnet.to_string(), &zone)
            .await?;
    }

    ctx.state.network = Some(network);
    Ok(())
}

async fn ensure_firewall(ctx: &mut Context) -> Result<()> {
    if ctx.config.firewall.use_current_ipv4 {
        match ctx.infra.get_public_ip().await {
            Ok(ip) => {
                info!("Detected current public IP address: {}", ip);
                ctx.state.public_ip = Some(ip);
            }
            Err(e) => warn!("Could not detect current public IP, continuing without it: {}", e),
        }
    }

    let rules = build_rules(&ctx.config.firewall, ctx.state.public_ip.as_deref());
    let name = format!("{}-firewall", ctx.config.cluster_name);
    let selector = format!("cluster={}", ctx.config.cluster_name);

    let firewall = ctx
        .infra
        .ensure_firewall(&name, rules, &ctx.config.base_labels(), &selector)
        .await?;

    ctx.state.firewall = Some(firewall);
    Ok(())
}

/// Build the firewall rule set: the Kubernetes and Talos API ports with
/// their allow-lists, then the user's extra rules.
fn build_rules(firewall: &FirewallConfig, current_ip: Option<&str>) -> Vec<FirewallRule> {
    let current_cidr = current_ip.map(|ip| {
        if ip.contains('/') {
            ip.to_string()
        } else {
            format!("{}/32", ip)
        }
    });

    let sources = |allowed: &[String]| -> Vec<String> {
        let mut sources: Vec<String> = allowed.to_vec();
        if let Some(cidr) = &current_cidr {
            if !sources.contains(cidr) {
                sources.push(cidr.clone());
            }
        }
        if sources.is_empty() {
            // An empty allow-list with no detected operator IP would
            // lock everyone out of a cluster that only answers on these
            // ports. Fall open.
            sources = vec!["0.0.0.0/0".to_string(), "::/0".to_string()];
        }
        sources
    };

    let mut rules = vec![
        FirewallRule {
            direction: "in".to_string(),
            protocol: "tcp".to_string(),
            port: Some(KUBE_API_PORT.to_string()),
            source_ips: sources(&firewall.api_allowed_ips),
            destination_ips: vec![],
        },
        FirewallRule {
            direction: "in".to_string(),
            protocol: "tcp".to_string(),
            port: Some(TALOS_API_PORT.to_string()),
            source_ips: sources(&firewall.talos_allowed_ips),
            destination_ips: vec![],
        },
    ];

    for extra in &firewall.extra_rules {
        rules.push(FirewallRule {
            direction: extra.direction.clone(),
            protocol: extra.protocol.clone(),
            port: extra.port.clone(),
            source_ips: extra.source_ips.clone(),
            destination_ips: extra.destination_ips.clone(),
        });
    }

    rules
}

/// `<cluster>-kube`: the single entry point for both the Kubernetes API
/// and (in private-access clusters) the Talos API.
async fn ensure_load_balancer(ctx: &mut Context) -> Result<()> {
    let control_plane_count: u32 = ctx.config.control_planes.iter().map(|p| p.count).sum();
    if control_plane_count == 0 {
        debug!("No control plane nodes configured, skipping load balancer");
        return Ok(());
    }

    let layout = *ctx.config.subnets()?;
    let name = format!("{}-kube", ctx.config.cluster_name);

    let lb = ctx
        .infra
        .ensure_load_balancer(
            &name,
            &ctx.config.hcloud.location,
            LOAD_BALANCER_TYPE,
            "round_robin",
            &ctx.config.base_labels(),
        )
        .await?;

    // The API server answers /version with 401 for anonymous callers;
    // that response proves liveness.
    ctx.infra
        .configure_service(
            &lb,
            LoadBalancerService {
                protocol: "tcp".to_string(),
                listen_port: KUBE_API_PORT,
                destination_port: KUBE_API_PORT,
                health_check: HealthCheck {
                    protocol: "http".to_string(),
                    port: KUBE_API_PORT,
                    interval: 3,
                    timeout: 2,
                    retries: 2,
                    http: Some(HttpHealthCheck {
                        path: "/version".to_string(),
                        status_codes: vec!["401".to_string()],
                        tls: true,
                    }),
                },
            },
        )
        .await?;

    ctx.infra
        .configure_service(
            &lb,
            LoadBalancerService {
                protocol: "tcp".to_string(),
                listen_port: TALOS_API_PORT,
                destination_port: TALOS_API_PORT,
                health_check: HealthCheck {
                    protocol: "tcp".to_string(),
                    port: TALOS_API_PORT,
                    interval: 5,
                    timeout: 3,
                    retries: 2,
                    http: None,
                },
            },
        )
        .await?;

    let network = ctx
        .state
        .network
        .as_ref()
        .context("network must be ensured before the load balancer")?;
    ctx.infra
        .attach_to_network(&lb, network, &layout.load_balancer_ip().to_string())
        .await?;

    let selector = format!("cluster={},role=control-plane", ctx.config.cluster_name);
    ctx.infra.add_target(&lb, &selector).await?;

    // The attach response does not carry the private-network IPs; a
    // re-fetch does. Fall back to the local object if the refresh fails.
    let lb = match ctx.infra.get_load_balancer(&name).await {
        Ok(Some(fresh)) => fresh,
        Ok(None) => {
            warn!("Load balancer {} vanished during refresh, using attach-time state", name);
            lb
        }
        Err(e) => {
            warn!("Could not refresh load balancer {}: {}", name, e);
            lb
        }
    };

    let public_ipv4 = lb
        .public_ipv4()
        .with_context(|| format!("load balancer {} has no public IPv4", name))?;

    ctx.producer
        .set_endpoint(&format!("https://{}:{}", public_ipv4, KUBE_API_PORT))
        .await;

    if let Some(template) = ctx
        .config
        .rdns
        .as_ref()
        .and_then(|r| r.load_balancer_template.clone())
    {
        let vars = rdns::RdnsVars::new(&ctx.config.cluster_name, &lb.name, &public_ipv4);
        match rdns::render(&template, &vars) {
            Ok(ptr) => {
                if let Err(e) = ctx.infra.set_load_balancer_rdns(lb.id, &public_ipv4, &ptr).await {
                    warn!("Could not set load balancer reverse DNS: {}", e);
                }
            }
            Err(e) => warn!("Could not render load balancer reverse DNS template: {}", e),
        }
    }

    ctx.state.load_balancer = Some(lb);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtraFirewallRule;

    fn firewall_config() -> FirewallConfig {
        FirewallConfig {
            api_allowed_ips: vec!["203.0.113.0/24".to_string()],
            talos_allowed_ips: vec!["203.0.113.7/32".to_string()],
            use_current_ipv4: false,
            extra_rules: vec![],
        }
    }

    #[test]
    fn test_build_rules_uses_allow_lists() {
        let rules = build_rules(&firewall_config(), None);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].port.as_deref(), Some("6443"));
        assert_eq!(rules[0].source_ips, vec!["203.0.113.0/24"]);
        assert_eq!(rules[1].port.as_deref(), Some("50000"));
        assert_eq!(rules[1].source_ips, vec!["203.0.113.7/32"]);
    }

    #[test]
    fn test_build_rules_appends_current_ip_as_host_route() {
        let rules = build_rules(&firewall_config(), Some("198.51.100.9"));
        assert!(rules[0].source_ips.contains(&"198.51.100.9/32".to_string()));
        assert!(rules[1].source_ips.contains(&"198.51.100.9/32".to_string()));
    }

    #[test]
    fn test_build_rules_falls_open_without_sources() {
        let rules = build_rules(&FirewallConfig::default(), None);
        assert_eq!(rules[0].source_ips, vec!["0.0.0.0/0", "::/0"]);
    }

    #[test]
    fn test_build_rules_includes_extra_rules() {
        let mut config = firewall_config();
        config.extra_rules.push(ExtraFirewallRule {
            direction: "out".to_string(),
            protocol: "udp".to_string(),
            port: Some("53".to_string()),
            source_ips: vec![],
            destination_ips: vec!["0.0.0.0/0".to_string()],
        });
        let rules = build_rules(&config, None);
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[2].direction, "out");
        assert_eq!(rules[2].protocol, "udp");
    }
}
