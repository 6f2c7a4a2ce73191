/// Infrastructure capability surface and its Hetzner Cloud implementation
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{info, warn};

use super::client::{
    CreateCertificateRequest, CreateFirewallRequest, CreateLoadBalancerRequest,
    CreateNetworkRequest, CreatePlacementGroupRequest, CreateServerRequest, CreateSshKeyRequest,
    FirewallResourceRef, HetznerCloudClient, LoadBalancerAlgorithm, PrivateNetRequest,
    PublicNetRequest, SubnetRequest,
};
use super::models::{
    label_selector, Certificate, Firewall, FirewallRule, Image, LabelSelector, LoadBalancer,
    LoadBalancerService, Network, PlacementGroup, SshKey,
};

/// Options for creating a server
#[derive(Debug, Clone)]
pub struct CreateServerOpts {
    pub name: String,
    pub server_type: String,
    pub location: String,
    pub image: String,
    pub ssh_keys: Vec<String>,
    pub labels: HashMap<String, String>,
    pub user_data: Option<String>,
    pub placement_group: Option<i64>,
    pub network_id: i64,
    pub private_ip: String,
    pub enable_public_ipv4: bool,
    pub enable_public_ipv6: bool,
}

/// Narrow capability surface the provisioning phases depend on. Every
/// `ensure_*` is idempotent: consult the cloud by name or labels, create
/// only when absent.
#[async_trait]
pub trait InfrastructureManager: Send + Sync {
    async fn ensure_network(
        &self,
        name: &str,
        ip_range: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Network>;

    async fn ensure_subnet(&self, network: &Network, ip_range: &str, zone: &str) -> Result<()>;

    async fn ensure_firewall(
        &self,
        name: &str,
        rules: Vec<FirewallRule>,
        labels: &HashMap<String, String>,
        apply_to_selector: &str,
    ) -> Result<Firewall>;

    async fn ensure_load_balancer(
        &self,
        name: &str,
        location: &str,
        lb_type: &str,
        algorithm: &str,
        labels: &HashMap<String, String>,
    ) -> Result<LoadBalancer>;

    async fn configure_service(
        &self,
        lb: &LoadBalancer,
        service: LoadBalancerService,
    ) -> Result<()>;

    async fn attach_to_network(
        &self,
        lb: &LoadBalancer,
        network: &Network,
        private_ip: &str,
    ) -> Result<()>;

    async fn add_target(&self, lb: &LoadBalancer, selector: &str) -> Result<()>;

    async fn get_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>>;

    async fn ensure_placement_group(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<PlacementGroup>;

    async fn get_server_id(&self, name: &str) -> Result<Option<i64>>;

    async fn get_server_ip(&self, name: &str) -> Result<Option<String>>;

    async fn create_server(&self, opts: CreateServerOpts) -> Result<i64>;

    async fn get_snapshot_by_labels(&self, labels: &HashMap<String, String>) -> Result<Option<Image>>;

    async fn set_server_rdns(&self, server_id: i64, ip: &str, ptr: &str) -> Result<()>;

    async fn set_load_balancer_rdns(&self, lb_id: i64, ip: &str, ptr: &str) -> Result<()>;

    async fn get_certificate(&self, name: &str) -> Result<Option<Certificate>>;

    async fn ensure_certificate(
        &self,
        name: &str,
        certificate: &str,
        private_key: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Certificate>;

    async fn ensure_ssh_key(
        &self,
        name: &str,
        public_key: &str,
        labels: &HashMap<String, String>,
    ) -> Result<SshKey>;

    async fn delete_ssh_key(&self, name: &str) -> Result<()>;

    /// Remove every resource matching the labels, in dependency order.
    async fn cleanup_by_label(&self, labels: &HashMap<String, String>) -> Result<()>;

    /// Discover the operator's current egress IPv4.
    async fn get_public_ip(&self) -> Result<String>;
}

/// `InfrastructureManager` backed by the Hetzner Cloud API
pub struct HcloudManager {
    client: HetznerCloudClient,
}

impl HcloudManager {
    pub fn new(client: HetznerCloudClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InfrastructureManager for HcloudManager {
    async fn ensure_network(
        &self,
        name: &str,
        ip_range: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Network> {
        if let Some(network) = self.client.get_network_by_name(name).await? {
            info!("Found existing network: {} (ID: {})", network.name, network.id);
            return Ok(network);
        }

        info!("Creating private network: {} ({})", name, ip_range);
        let request = CreateNetworkRequest {
            name: name.to_string(),
            ip_range: ip_range.to_string(),
            subnets: None,
            labels: Some(labels.clone()),
        };

        self.client
            .create_network(&request)
            .await
            .with_context(|| format!("Failed to create network {}", name))
    }

    async fn ensure_subnet(&self, network: &Network, ip_range: &str, zone: &str) -> Result<()> {
        if network.subnets.iter().any(|s| s.ip_range == ip_range) {
            return Ok(());
        }

        info!("Adding subnet {} to network {}", ip_range, network.name);
        self.client
            .add_subnet(
                network.id,
                &SubnetRequest {
                    ip_range: ip_range.to_string(),
                    network_zone: zone.to_string(),
                    subnet_type: "cloud".to_string(),
                },
            )
            .await
            .with_context(|| format!("Failed to add subnet {} to network {}", ip_range, network.name))
    }

    async fn ensure_firewall(
        &self,
        name: &str,
        rules: Vec<FirewallRule>,
        labels: &HashMap<String, String>,
        apply_to_selector: &str,
    ) -> Result<Firewall> {
        if let Some(firewall) = self.client.get_firewall_by_name(name).await? {
            info!("Updating rules of existing firewall: {} (ID: {})", firewall.name, firewall.id);
            if firewall.rules != rules {
                self.client
                    .set_firewall_rules(firewall.id, &rules)
                    .await
                    .with_context(|| format!("Failed to update rules of firewall {}", name))?;
            }
            self.client
                .apply_firewall_to_selector(firewall.id, apply_to_selector)
                .await
                .with_context(|| format!("Failed to apply firewall {} to servers", name))?;
            return Ok(firewall);
        }

        info!("Creating firewall: {} ({} rules)", name, rules.len());
        let request = CreateFirewallRequest {
            name: name.to_string(),
            rules,
            labels: Some(labels.clone()),
            apply_to: Some(vec![FirewallResourceRef {
                resource_type: "label_selector".to_string(),
                label_selector: Some(LabelSelector {
                    selector: apply_to_selector.to_string(),
                }),
            }]),
        };

        self.client
            .create_firewall(&request)
            .await
            .with_context(|| format!("Failed to create firewall {}", name))
    }

    async fn ensure_load_balancer(
        &self,
        name: &str,
        location: &str,
        lb_type: &str,
        algorithm: &str,
        labels: &HashMap<String, String>,
    ) -> Result<LoadBalancer> {
        if let Some(lb) = self.client.get_load_balancer_by_name(name).await? {
            info!("Found existing load balancer: {} (ID: {})", lb.name, lb.id);
            return Ok(lb);
        }

        info!("Creating load balancer: {} (type: {})", name, lb_type);
        let request = CreateLoadBalancerRequest {
            name: name.to_string(),
            load_balancer_type: lb_type.to_string(),
            location: location.to_string(),
            algorithm: LoadBalancerAlgorithm {
                algorithm_type: algorithm.to_string(),
            },
            labels: Some(labels.clone()),
        };

        self.client
            .create_load_balancer(&request)
            .await
            .with_context(|| format!("Failed to create load balancer {}", name))
    }

    async fn configure_service(
        &self,
        lb: &LoadBalancer,
        service: LoadBalancerService,
    ) -> Result<()> {
        if lb
            .services
            .iter()
            .any(|s| s.listen_port == service.listen_port)
        {
            return Ok(());
        }

        info!(
            "Adding service {}:{} to load balancer {}",
            service.protocol, service.listen_port, lb.name
        );
        self.client
            .add_load_balancer_service(lb.id, &service)
            .await
            .with_context(|| {
                format!(
                    "Failed to add service on port {} to load balancer {}",
                    service.listen_port, lb.name
                )
            })
    }

    async fn attach_to_network(
        &self,
        lb: &LoadBalancer,
        network: &Network,
        private_ip: &str,
    ) -> Result<()> {
        if lb.private_net.iter().any(|net| net.network == network.id) {
            return Ok(());
        }

        info!(
            "Attaching load balancer {} to network {} at {}",
            lb.name, network.name, private_ip
        );
        self.client
            .attach_load_balancer_to_network(lb.id, network.id, private_ip)
            .await
            .with_context(|| format!("Failed to attach load balancer {} to network", lb.name))
    }

    async fn add_target(&self, lb: &LoadBalancer, selector: &str) -> Result<()> {
        if lb.targets.iter().any(|t| {
            t.target_type == "label_selector"
                && t.label_selector
                    .as_ref()
                    .is_some_and(|ls| ls.selector == selector)
        }) {
            return Ok(());
        }

        info!("Adding label-selector target to load balancer {}: {}", lb.name, selector);
        self.client
            .add_load_balancer_target(lb.id, selector)
            .await
            .with_context(|| format!("Failed to add target to load balancer {}", lb.name))
    }

    async fn get_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>> {
        Ok(self.client.get_load_balancer_by_name(name).await?)
    }

    async fn ensure_placement_group(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<PlacementGroup> {
        if let Some(pg) = self.client.get_placement_group_by_name(name).await? {
            return Ok(pg);
        }

        info!("Creating placement group: {}", name);
        let request = CreatePlacementGroupRequest {
            name: name.to_string(),
            group_type: "spread".to_string(),
            labels: Some(labels.clone()),
        };

        self.client
            .create_placement_group(&request)
            .await
            .with_context(|| format!("Failed to create placement group {}", name))
    }

    async fn get_server_id(&self, name: &str) -> Result<Option<i64>> {
        Ok(self
            .client
            .get_server_by_name(name)
            .await?
            .map(|server| server.id))
    }

    async fn get_server_ip(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .client
            .get_server_by_name(name)
            .await?
            .and_then(|server| server.reachable_ip()))
    }

    async fn create_server(&self, opts: CreateServerOpts) -> Result<i64> {
        info!("Creating server: {} (type: {})", opts.name, opts.server_type);

        let request = CreateServerRequest {
            name: opts.name.clone(),
            server_type: opts.server_type,
            location: opts.location,
            image: opts.image,
            ssh_keys: if opts.ssh_keys.is_empty() {
                None
            } else {
                Some(opts.ssh_keys)
            },
            user_data: opts.user_data,
            networks: None,
            private_net: Some(vec![PrivateNetRequest {
                network: opts.network_id,
                ip: opts.private_ip,
            }]),
            placement_group: opts.placement_group,
            labels: Some(opts.labels),
            public_net: PublicNetRequest {
                enable_ipv4: opts.enable_public_ipv4,
                enable_ipv6: opts.enable_public_ipv6,
            },
            start_after_create: true,
        };

        let response = self
            .client
            .create_server(&request)
            .await
            .with_context(|| format!("Failed to create server {}", opts.name))?;

        self.client
            .wait_for_action(response.action.id, std::time::Duration::from_secs(300))
            .await
            .with_context(|| format!("Server {} creation action failed", opts.name))?;

        Ok(response.server.id)
    }

    async fn get_snapshot_by_labels(&self, labels: &HashMap<String, String>) -> Result<Option<Image>> {
        let selector = label_selector(labels);
        let mut snapshots = self.client.list_snapshots_by_selector(&selector).await?;
        Ok(if snapshots.is_empty() {
            None
        } else {
            Some(snapshots.remove(0))
        })
    }

    async fn set_server_rdns(&self, server_id: i64, ip: &str, ptr: &str) -> Result<()> {
        self.client
            .change_server_dns_ptr(server_id, ip, ptr)
            .await
            .with_context(|| format!("Failed to set reverse DNS for server {}", server_id))
    }

    async fn set_load_balancer_rdns(&self, lb_id: i64, ip: &str, ptr: &str) -> Result<()> {
        self.client
            .change_load_balancer_dns_ptr(lb_id, ip, ptr)
            .await
            .with_context(|| format!("Failed to set reverse DNS for load balancer {}", lb_id))
    }

    async fn get_certificate(&self, name: &str) -> Result<Option<Certificate>> {
        Ok(self.client.get_certificate_by_name(name).await?)
    }

    async fn ensure_certificate(
        &self,
        name: &str,
        certificate: &str,
        private_key: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Certificate> {
        if let Some(cert) = self.client.get_certificate_by_name(name).await? {
            return Ok(cert);
        }

        info!("Creating certificate: {}", name);
        let request = CreateCertificateRequest {
            name: name.to_string(),
            certificate: certificate.to_string(),
            private_key: private_key.to_string(),
            cert_type: "uploaded".to_string(),
            labels: Some(labels.clone()),
        };

        self.client
            .create_certificate(&request)
            .await
            .with_context(|| format!("Failed to create certificate {}", name))
    }

    async fn ensure_ssh_key(
        &self,
        name: &str,
        public_key: &str,
        labels: &HashMap<String, String>,
    ) -> Result<SshKey> {
        if let Some(key) = self.client.get_ssh_key_by_name(name).await? {
            info!("Using existing SSH key: {} (ID: {})", key.name, key.id);
            return Ok(key);
        }

        info!("Uploading SSH key: {}", name);
        let request = CreateSshKeyRequest {
            name: name.to_string(),
            public_key: public_key.to_string(),
            labels: Some(labels.clone()),
        };

        self.client
            .create_ssh_key(&request)
            .await
            .with_context(|| format!("Failed to create SSH key {}", name))
    }

    async fn delete_ssh_key(&self, name: &str) -> Result<()> {
        if let Some(key) = self.client.get_ssh_key_by_name(name).await? {
            self.client
                .delete_ssh_key(key.id)
                .await
                .with_context(|| format!("Failed to delete SSH key {}", name))?;
        }
        Ok(())
    }

    async fn cleanup_by_label(&self, labels: &HashMap<String, String>) -> Result<()> {
        use tokio::time::{sleep, Duration};

        let selector = label_selector(labels);
        info!("Removing all resources matching: {}", selector);

        for server in self.client.list_servers_by_selector(&selector).await? {
            info!("Deleting server: {} (ID: {})", server.name, server.id);
            if let Err(e) = self.client.delete_server(server.id).await {
                warn!("Failed to delete server {}: {}", server.name, e);
            }
        }

        for lb in self.client.list_load_balancers_by_selector(&selector).await? {
            info!("Deleting load balancer: {} (ID: {})", lb.name, lb.id);
            if let Err(e) = self.client.delete_load_balancer(lb.id).await {
                warn!("Failed to delete load balancer {}: {}", lb.name, e);
            }
        }

        // Servers may still be tearing down while their firewall is in
        // use; retry a few times before giving up.
        for firewall in self.client.list_firewalls_by_selector(&selector).await? {
            info!("Deleting firewall: {} (ID: {})", firewall.name, firewall.id);
            for attempt in 1..=12 {
                match self.client.delete_firewall(firewall.id).await {
                    Ok(_) => break,
                    Err(e) if e.is_resource_in_use() && attempt < 12 => {
                        info!(
                            "Firewall still in use, waiting for servers to be deleted (attempt {}/12)...",
                            attempt
                        );
                        sleep(Duration::from_secs(5)).await;
                    }
                    Err(e) => {
                        warn!("Failed to delete firewall {}: {}", firewall.name, e);
                        break;
                    }
                }
            }
        }

        for pg in self.client.list_placement_groups_by_selector(&selector).await? {
            info!("Deleting placement group: {} (ID: {})", pg.name, pg.id);
            if let Err(e) = self.client.delete_placement_group(pg.id).await {
                warn!("Failed to delete placement group {}: {}", pg.name, e);
            }
        }

        for network in self.client.list_networks_by_selector(&selector).await? {
            info!("Deleting network: {} (ID: {})", network.name, network.id);
            if let Err(e) = self.client.delete_network(network.id).await {
                warn!("Failed to delete network {}: {}", network.name, e);
            }
        }

        // Base snapshots are shared between clusters; only test runs own
        // their images.
        if labels.contains_key("test-id") {
            for image in self.client.list_snapshots_by_selector(&selector).await? {
                info!("Deleting snapshot (ID: {})", image.id);
                if let Err(e) = self.client.delete_image(image.id).await {
                    warn!("Failed to delete snapshot {}: {}", image.id, e);
                }
            }
        }

        for key in self.client.list_ssh_keys_by_selector(&selector).await? {
            info!("Deleting SSH key: {} (ID: {})", key.name, key.id);
            if let Err(e) = self.client.delete_ssh_key(key.id).await {
                warn!("Failed to delete SSH key {}: {}", key.name, e);
            }
        }

        for cert in self.client.list_certificates_by_selector(&selector).await? {
            info!("Deleting certificate: {} (ID: {})", cert.name, cert.id);
            if let Err(e) = self.client.delete_certificate(cert.id).await {
                warn!("Failed to delete certificate {}: {}", cert.name, e);
            }
        }

        Ok(())
    }

    async fn get_public_ip(&self) -> Result<String> {
        let client = reqwest::Client::new();
        let response = client
            .get("https://ipv4.icanhazip.com")
            .send()
            .await
            .context("Failed to get current IP address")?;

        let ip = response
            .text()
            .await
            .context("Failed to read IP address response")?;

        Ok(ip.trim().to_string())
    }
}
