/// Pre-flight validation and subnet derivation
use anyhow::Result;
use ipnet::Ipv4Net;
use tracing::warn;

use crate::config::ClusterConfig;
use crate::net::SubnetLayout;
use crate::pipeline::Context;

const VALID_PROTOCOLS: [&str; 5] = ["tcp", "udp", "icmp", "gre", "esp"];

/// Nodes per control-plane pool before private IPs collide with the next
/// pool's address block
const MAX_CONTROL_PLANES_PER_POOL: u32 = 10;

/// Usable node addresses in a per-pool worker /24
const MAX_WORKERS_PER_POOL: u32 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A single validation finding
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

/// Run all checks. Pure: no side effects, no cloud access.
pub fn check(config: &ClusterConfig) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if config.cluster_name.is_empty() {
        issues.push(ValidationIssue::error("cluster_name", "must not be empty"));
    } else if !is_dns_label(&config.cluster_name) {
        issues.push(ValidationIssue::error(
            "cluster_name",
            "must be a lowercase DNS label (a-z, 0-9, '-')",
        ));
    }

    if config.hcloud.location.is_empty() {
        issues.push(ValidationIssue::error("hcloud.location", "must not be empty"));
    }
    if config.hcloud.network.zone.is_empty() {
        issues.push(ValidationIssue::error("hcloud.network.zone", "must not be empty"));
    }

    match config.hcloud.network.cidr.parse::<Ipv4Net>() {
        Ok(parsed) => {
            if parsed.prefix_len() > 22 {
                issues.push(ValidationIssue::error(
                    "hcloud.network.cidr",
                    format!("{} is too small to split into role subnets", parsed),
                ));
            } else if parsed.prefix_len() > 16 {
                issues.push(ValidationIssue::warning(
                    "hcloud.network.cidr",
                    "a /16 network is recommended",
                ));
            }
        }
        Err(_) => {
            issues.push(ValidationIssue::error(
                "hcloud.network.cidr",
                format!("'{}' is not a valid IPv4 CIDR", config.hcloud.network.cidr),
            ));
        }
    }

    for (field, version) in [
        ("talos.version", &config.talos.version),
        ("talos.kubernetes_version", &config.talos.kubernetes_version),
    ] {
        if version.is_empty() {
            issues.push(ValidationIssue::error(field, "must not be empty"));
        } else if !version.starts_with('v') {
            issues.push(ValidationIssue::warning(
                field,
                format!("'{}' has no 'v' prefix", version),
            ));
        }
    }

    if config.control_planes.is_empty() {
        issues.push(ValidationIssue::warning(
            "control_planes",
            "no control plane pools configured; no load balancer will be created",
        ));
    }

    let mut seen_names = std::collections::HashSet::new();
    for (role, pools) in [("control_planes", &config.control_planes), ("workers", &config.workers)] {
        for (i, pool) in pools.iter().enumerate() {
            let field = format!("{}[{}]", role, i);
            if pool.name.is_empty() {
                issues.push(ValidationIssue::error(&field, "pool name must not be empty"));
            } else if !seen_names.insert(pool.name.clone()) {
                issues.push(ValidationIssue::error(
                    &field,
                    format!("duplicate pool name '{}'", pool.name),
                ));
            }
            if pool.server_type.is_empty() {
                issues.push(ValidationIssue::error(&field, "server_type must not be empty"));
            }
            if role == "control_planes" && pool.count > MAX_CONTROL_PLANES_PER_POOL {
                issues.push(ValidationIssue::error(
                    &field,
                    format!("control plane pools hold at most {} nodes", MAX_CONTROL_PLANES_PER_POOL),
                ));
            }
            if role == "workers" && pool.count > MAX_WORKERS_PER_POOL {
                issues.push(ValidationIssue::error(
                    &field,
                    format!("worker pools hold at most {} nodes", MAX_WORKERS_PER_POOL),
                ));
            }
        }
    }

    for (i, rule) in config.firewall.extra_rules.iter().enumerate() {
        let field = format!("firewall.extra_rules[{}]", i);
        if !matches!(rule.direction.as_str(), "in" | "out") {
            issues.push(ValidationIssue::error(
                &field,
                format!("direction must be 'in' or 'out', got '{}'", rule.direction),
            ));
        }
        if !VALID_PROTOCOLS.contains(&rule.protocol.as_str()) {
            issues.push(ValidationIssue::error(
                &field,
                format!("protocol must be one of {:?}, got '{}'", VALID_PROTOCOLS, rule.protocol),
            ));
        }
        if matches!(rule.protocol.as_str(), "tcp" | "udp") && rule.port.is_none() {
            issues.push(ValidationIssue::error(&field, "tcp/udp rules need a port"));
        }
    }

    issues
}

/// Report findings and derive the subnet layout onto the config — the
/// only mutation this phase performs.
pub async fn run(ctx: &mut Context) -> Result<()> {
    let issues = check(&ctx.config);

    let mut errors = Vec::new();
    for issue in &issues {
        match issue.severity {
            Severity::Warning => warn!(field = %issue.field, "{}", issue.message),
            Severity::Error => errors.push(format!("{}: {}", issue.field, issue.message)),
        }
    }

    if !errors.is_empty() {
        anyhow::bail!("configuration invalid: {}", errors.join("; "));
    }

    let parent: Ipv4Net = ctx
        .config
        .hcloud
        .network
        .cidr
        .parse()
        .map_err(|e| anyhow::anyhow!("hcloud.network.cidr: {}", e))?;
    ctx.config.subnets = Some(SubnetLayout::derive(parent)?);

    Ok(())
}

fn is_dns_label(name: &str) -> bool {
    name.len() <= 63
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}
