/// Configuration management for Basalt - Talos Kubernetes on Hetzner Cloud
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::net::SubnetLayout;

/// Main cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name (used for resource naming and the discovery label)
    pub cluster_name: String,

    /// Hetzner Cloud configuration
    pub hcloud: HetznerCloudConfig,

    /// Talos configuration
    pub talos: TalosConfig,

    /// Control plane node pools
    pub control_planes: Vec<NodePool>,

    /// Worker node pools
    #[serde(default)]
    pub workers: Vec<NodePool>,

    /// Names of pre-existing SSH keys to attach to servers. When empty an
    /// ephemeral key is generated for the run.
    #[serde(default)]
    pub ssh_keys: Vec<String>,

    /// Firewall configuration
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// Reverse-DNS templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdns: Option<RdnsConfig>,

    /// How the cluster is reached from outside
    #[serde(default)]
    pub cluster_access: ClusterAccess,

    /// Test isolation ID, propagated as a label on every resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,

    /// Role subnets derived from the network CIDR by the validation phase
    #[serde(skip)]
    pub subnets: Option<SubnetLayout>,
}

/// Hetzner Cloud API and network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerCloudConfig {
    /// Hetzner Cloud API token (can also be set via HCLOUD_TOKEN env var)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Hetzner Cloud location (e.g., "nbg1")
    pub location: String,

    /// Private network configuration
    pub network: NetworkConfig,
}

/// Private network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network CIDR (e.g., "10.0.0.0/16")
    pub cidr: String,

    /// Network zone (e.g., "eu-central")
    pub zone: String,
}

/// Talos-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TalosConfig {
    /// Talos version (e.g., "v1.7.0")
    pub version: String,

    /// Kubernetes version (e.g., "v1.30.0")
    pub kubernetes_version: String,
}

/// Node pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePool {
    /// Pool name
    pub name: String,

    /// Hetzner server type (e.g., "cpx21", "cax31")
    pub server_type: String,

    /// Number of nodes in this pool
    #[serde(default = "default_one")]
    pub count: u32,

    /// Location override; falls back to the cluster location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Image override; skips snapshot resolution by labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Additional labels for servers in this pool
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Spread nodes over sharded placement groups (workers only)
    #[serde(default)]
    pub placement_group: bool,

    /// Attach a public IPv4. When neither flag is set servers come up
    /// dual-stack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_public_ipv4: Option<bool>,

    /// Attach a public IPv6
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_public_ipv6: Option<bool>,
}

impl NodePool {
    /// Public-IP enablement: dual-stack unless the pool says otherwise.
    pub fn public_net(&self) -> (bool, bool) {
        match (self.enable_public_ipv4, self.enable_public_ipv6) {
            (None, None) => (true, true),
            (v4, v6) => (v4.unwrap_or(false), v6.unwrap_or(false)),
        }
    }
}

/// Firewall configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Source CIDRs allowed to reach the Kubernetes API (6443/tcp)
    #[serde(default)]
    pub api_allowed_ips: Vec<String>,

    /// Source CIDRs allowed to reach the Talos API (50000/tcp)
    #[serde(default)]
    pub talos_allowed_ips: Vec<String>,

    /// Also allow the operator's current public IPv4
    #[serde(default)]
    pub use_current_ipv4: bool,

    /// Additional user-supplied rules
    #[serde(default)]
    pub extra_rules: Vec<ExtraFirewallRule>,
}

/// A user-supplied firewall rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraFirewallRule {
    /// "in" or "out"
    pub direction: String,

    /// One of tcp, udp, icmp, gre, esp
    pub protocol: String,

    /// Port or port range; required for tcp/udp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    #[serde(default)]
    pub source_ips: Vec<String>,

    #[serde(default)]
    pub destination_ips: Vec<String>,
}

/// Reverse-DNS templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdnsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_template: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_template: Option<String>,
}

/// Cluster access mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterAccess {
    /// Nodes carry public IPs; the Talos API is reached per node
    #[default]
    Public,
    /// Control planes have no public IPv4; everything goes through the
    /// load balancer VIP
    Private,
}

fn default_one() -> u32 {
    1
}

impl ClusterConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClusterConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Get Hetzner Cloud API token from config or environment
    pub fn get_hcloud_token(&self) -> anyhow::Result<String> {
        self.hcloud
            .token
            .clone()
            .or_else(|| std::env::var("HCLOUD_TOKEN").ok())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Hetzner Cloud API token not found. Set HCLOUD_TOKEN environment variable or specify in config"
                )
            })
    }

    /// Labels stamped onto every resource this tool creates. The
    /// `cluster` pair is the only discovery key; `test-id` isolates
    /// concurrent test runs.
    pub fn base_labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::from([
            ("cluster".to_string(), self.cluster_name.clone()),
            ("managed-by".to_string(), "basalt".to_string()),
        ]);
        if let Some(test_id) = &self.test_id {
            labels.insert("test-id".to_string(), test_id.clone());
        }
        labels
    }

    /// The label selector that finds everything belonging to this cluster.
    pub fn selector_labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::from([("cluster".to_string(), self.cluster_name.clone())]);
        if let Some(test_id) = &self.test_id {
            labels.insert("test-id".to_string(), test_id.clone());
        }
        labels
    }

    /// The derived subnet layout; only available after validation ran.
    pub fn subnets(&self) -> anyhow::Result<&SubnetLayout> {
        self.subnets
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("subnet layout not derived yet; validation phase must run first"))
    }

    /// Generate an example configuration
    pub fn example() -> Self {
        Self {
            cluster_name: "talos-cluster".to_string(),
            hcloud: HetznerCloudConfig {
                token: None,
                location: "nbg1".to_string(),
                network: NetworkConfig {
                    cidr: "10.0.0.0/16".to_string(),
                    zone: "eu-central".to_string(),
                },
            },
            talos: TalosConfig {
                version: "v1.7.0".to_string(),
                kubernetes_version: "v1.30.0".to_string(),
            },
            control_planes: vec![NodePool {
                name: "cp".to_string(),
                server_type: "cpx21".to_string(),
                count: 3,
                location: None,
                image: None,
                labels: HashMap::new(),
                placement_group: false,
                enable_public_ipv4: None,
                enable_public_ipv6: None,
            }],
            workers: vec![NodePool {
                name: "pool".to_string(),
                server_type: "cpx31".to_string(),
                count: 3,
                location: None,
                image: None,
                labels: HashMap::new(),
                placement_group: true,
                enable_public_ipv4: None,
                enable_public_ipv6: None,
            }],
            ssh_keys: Vec::new(),
            firewall: FirewallConfig::default(),
            rdns: None,
            cluster_access: ClusterAccess::Public,
            test_id: None,
            subnets: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_labels_carry_test_id() {
        let mut config = ClusterConfig::example();
        config.test_id = Some("t42".to_string());
        let labels = config.base_labels();
        assert_eq!(labels.get("cluster").unwrap(), "talos-cluster");
        assert_eq!(labels.get("test-id").unwrap(), "t42");
    }

    #[test]
    fn test_public_net_defaults_to_dual_stack() {
        let pool = ClusterConfig::example().control_planes[0].clone();
        assert_eq!(pool.public_net(), (true, true));
    }

    #[test]
    fn test_public_net_single_flag_disables_other() {
        let mut pool = ClusterConfig::example().control_planes[0].clone();
        pool.enable_public_ipv6 = Some(true);
        assert_eq!(pool.public_net(), (false, true));
    }

    #[test]
    fn test_cluster_access_parses_lowercase() {
        let access: ClusterAccess = serde_yaml::from_str("private").unwrap();
        assert_eq!(access, ClusterAccess::Private);
    }

    #[test]
    fn test_example_roundtrips_through_yaml() {
        let yaml = serde_yaml::to_string(&ClusterConfig::example()).unwrap();
        let parsed: ClusterConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.cluster_name, "talos-cluster");
        assert_eq!(parsed.control_planes[0].count, 3);
    }
}
