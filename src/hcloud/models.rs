/// Hetzner Cloud API data models
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Hetzner Cloud server resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub public_net: PublicNetwork,
    #[serde(default)]
    pub private_net: Vec<PrivateNetwork>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Server {
    /// The address the provisioner reaches this server at: public IPv4
    /// when present, first private IP otherwise.
    pub fn reachable_ip(&self) -> Option<String> {
        self.public_net
            .ipv4
            .as_ref()
            .map(|v4| v4.ip.clone())
            .or_else(|| self.private_net.first().map(|net| net.ip.clone()))
    }
}

/// Public network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicNetwork {
    pub ipv4: Option<IPv4>,
    pub ipv6: Option<IPv6>,
}

/// IPv4 address information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPv4 {
    pub ip: String,
}

/// IPv6 address information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPv6 {
    pub ip: String,
}

/// Private network attachment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateNetwork {
    pub network: i64,
    pub ip: String,
}

/// Network resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: i64,
    pub name: String,
    pub ip_range: String,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Network subnet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub ip_range: String,
    pub network_zone: String,
    #[serde(rename = "type")]
    pub subnet_type: String,
}

/// Firewall resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Firewall {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Firewall rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub direction: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default)]
    pub source_ips: Vec<String>,
    #[serde(default)]
    pub destination_ips: Vec<String>,
}

/// Load balancer resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub public_net: LoadBalancerPublicNet,
    #[serde(default)]
    pub private_net: Vec<LoadBalancerPrivateNet>,
    #[serde(default)]
    pub services: Vec<LoadBalancerService>,
    #[serde(default)]
    pub targets: Vec<LoadBalancerTarget>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl LoadBalancer {
    pub fn public_ipv4(&self) -> Option<String> {
        self.public_net.ipv4.as_ref().map(|v4| v4.ip.clone())
    }

    pub fn private_ipv4s(&self) -> Vec<String> {
        self.private_net.iter().map(|net| net.ip.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerPublicNet {
    pub ipv4: Option<IPv4>,
    pub ipv6: Option<IPv6>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerPrivateNet {
    pub network: i64,
    pub ip: String,
}

/// Load balancer service (listener + health check)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerService {
    pub protocol: String,
    pub listen_port: u16,
    pub destination_port: u16,
    pub health_check: HealthCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub protocol: String,
    pub port: u16,
    /// Seconds between checks
    pub interval: u64,
    /// Seconds before a check counts as failed
    pub timeout: u64,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpHealthCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpHealthCheck {
    pub path: String,
    pub status_codes: Vec<String>,
    pub tls: bool,
}

/// Load balancer target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerTarget {
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelSelector {
    pub selector: String,
}

/// Placement group resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementGroup {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Certificate resource. Only used as the cluster-state marker; the
/// cryptographic contents are never read back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Image (snapshot) resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// SSH key resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKey {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Action represents an asynchronous operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: i64,
    pub status: String,
    #[serde(default)]
    pub progress: u32,
    pub error: Option<ActionError>,
}

/// Action error details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionError {
    pub code: String,
    pub message: String,
}

/// Error response from the API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ApiError,
}

/// API error details
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// Server CPU architecture, derived from the server type name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    /// Hetzner's Ampere types are the `cax` family; everything else is x86.
    pub fn from_server_type(server_type: &str) -> Self {
        if server_type.starts_with("cax") {
            Architecture::Arm64
        } else {
            Architecture::Amd64
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::Amd64 => write!(f, "amd64"),
            Architecture::Arm64 => write!(f, "arm64"),
        }
    }
}

/// Render a label map as a Hetzner label selector expression.
pub fn label_selector(labels: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    pairs.sort();
    pairs.join(",")
}
