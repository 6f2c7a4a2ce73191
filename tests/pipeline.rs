/// End-to-end pipeline scenarios against in-memory fakes
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use basalt::config::{ClusterAccess, ClusterConfig, NodePool};
use basalt::hcloud::models::{
    Certificate, Firewall, FirewallRule, IPv4, Image, LabelSelector, LoadBalancer,
    LoadBalancerPrivateNet, LoadBalancerPublicNet, LoadBalancerService, LoadBalancerTarget,
    Network, PlacementGroup, SshKey, Subnet,
};
use basalt::hcloud::{CreateServerOpts, InfrastructureManager};
use basalt::phases::bootstrap;
use basalt::pipeline::{Context, Pipeline, Timeouts};
use basalt::talos::{TalosApi, TalosConfigProducer};

const LB_PUBLIC_IP: &str = "198.51.100.10";

// ---------------------------------------------------------------------------
// Fake node fleet shared between the cloud and the Talos API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeMode {
    Offline,
    Maintenance,
    Configured,
    /// Reachable on the port but refusing every RPC
    Broken,
}

type Fleet = Arc<Mutex<HashMap<String, NodeMode>>>;

// ---------------------------------------------------------------------------
// Fake infrastructure manager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CloudStore {
    networks: HashMap<String, Network>,
    firewalls: HashMap<String, Firewall>,
    load_balancers: HashMap<String, LoadBalancer>,
    placement_groups: HashMap<String, PlacementGroup>,
    servers: HashMap<String, (i64, String, HashMap<String, String>)>,
    certificates: HashMap<String, Certificate>,
    ssh_keys: HashMap<String, SshKey>,
    creates: HashMap<&'static str, u32>,
    created_servers: Vec<CreateServerOpts>,
    snapshot_queries: Vec<HashMap<String, String>>,
    cleanup_calls: Vec<HashMap<String, String>>,
    deleted_ssh_keys: Vec<String>,
    next_id: i64,
}

struct FakeInfra {
    store: Mutex<CloudStore>,
    fleet: Fleet,
    has_snapshot: bool,
}

impl FakeInfra {
    fn new(fleet: Fleet) -> Self {
        Self {
            store: Mutex::new(CloudStore {
                next_id: 100,
                ..Default::default()
            }),
            fleet,
            has_snapshot: true,
        }
    }

    fn without_snapshot(fleet: Fleet) -> Self {
        Self {
            has_snapshot: false,
            ..Self::new(fleet)
        }
    }

    fn create_count(&self, kind: &str) -> u32 {
        *self.store.lock().unwrap().creates.get(kind).unwrap_or(&0)
    }

    fn create_counts(&self) -> HashMap<&'static str, u32> {
        self.store.lock().unwrap().creates.clone()
    }

    fn created_servers(&self) -> Vec<CreateServerOpts> {
        self.store.lock().unwrap().created_servers.clone()
    }

    fn cleanup_calls(&self) -> Vec<HashMap<String, String>> {
        self.store.lock().unwrap().cleanup_calls.clone()
    }

    fn deleted_ssh_keys(&self) -> Vec<String> {
        self.store.lock().unwrap().deleted_ssh_keys.clone()
    }

    fn network_subnets(&self, name: &str) -> Vec<String> {
        self.store.lock().unwrap().networks[name]
            .subnets
            .iter()
            .map(|s| s.ip_range.clone())
            .collect()
    }

    fn load_balancer(&self, name: &str) -> Option<LoadBalancer> {
        self.store.lock().unwrap().load_balancers.get(name).cloned()
    }

    fn resource_count(&self) -> usize {
        let store = self.store.lock().unwrap();
        store.networks.len()
            + store.firewalls.len()
            + store.load_balancers.len()
            + store.placement_groups.len()
            + store.servers.len()
            + store.certificates.len()
            + store.ssh_keys.len()
    }
}

#[async_trait]
impl InfrastructureManager for FakeInfra {
    async fn ensure_network(
        &self,
        name: &str,
        ip_range: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Network> {
        let mut store = self.store.lock().unwrap();
        if let Some(network) = store.networks.get(name) {
            return Ok(network.clone());
        }
        store.next_id += 1;
        let network = Network {
            id: store.next_id,
            name: name.to_string(),
            ip_range: ip_range.to_string(),
            subnets: Vec::new(),
            labels: labels.clone(),
        };
        store.networks.insert(name.to_string(), network.clone());
        *store.creates.entry("network").or_default() += 1;
        Ok(network)
    }

    async fn ensure_subnet(&self, network: &Network, ip_range: &str, zone: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        let stored = store
            .networks
            .get_mut(&network.name)
            .context("network does not exist")?;
        if stored.subnets.iter().any(|s| s.ip_range == ip_range) {
            return Ok(());
        }
        stored.subnets.push(Subnet {
            ip_range: ip_range.to_string(),
            network_zone: zone.to_string(),
            subnet_type: "cloud".to_string(),
        });
        *store.creates.entry("subnet").or_default() += 1;
        Ok(())
    }

    async fn ensure_firewall(
        &self,
        name: &str,
        rules: Vec<FirewallRule>,
        labels: &HashMap<String, String>,
        _apply_to_selector: &str,
    ) -> Result<Firewall> {
        let mut store = self.store.lock().unwrap();
        if let Some(firewall) = store.firewalls.get(name) {
            return Ok(firewall.clone());
        }
        store.next_id += 1;
        let firewall = Firewall {
            id: store.next_id,
            name: name.to_string(),
            rules,
            labels: labels.clone(),
        };
        store.firewalls.insert(name.to_string(), firewall.clone());
        *store.creates.entry("firewall").or_default() += 1;
        Ok(firewall)
    }

    async fn ensure_load_balancer(
        &self,
        name: &str,
        _location: &str,
        _lb_type: &str,
        _algorithm: &str,
        labels: &HashMap<String, String>,
    ) -> Result<LoadBalancer> {
        let mut store = self.store.lock().unwrap();
        if let Some(lb) = store.load_balancers.get(name) {
            return Ok(lb.clone());
        }
        store.next_id += 1;
        let lb = LoadBalancer {
            id: store.next_id,
            name: name.to_string(),
            public_net: LoadBalancerPublicNet {
                ipv4: Some(IPv4 {
                    ip: LB_PUBLIC_IP.to_string(),
                }),
                ipv6: None,
            },
            private_net: Vec::new(),
            services: Vec::new(),
            targets: Vec::new(),
            labels: labels.clone(),
        };
        store.load_balancers.insert(name.to_string(), lb.clone());
        *store.creates.entry("load_balancer").or_default() += 1;
        Ok(lb)
    }

    async fn configure_service(&self, lb: &LoadBalancer, service: LoadBalancerService) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        let stored = store
            .load_balancers
            .get_mut(&lb.name)
            .context("load balancer does not exist")?;
        if !stored.services.iter().any(|s| s.listen_port == service.listen_port) {
            stored.services.push(service);
        }
        Ok(())
    }

    async fn attach_to_network(
        &self,
        lb: &LoadBalancer,
        network: &Network,
        private_ip: &str,
    ) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        let stored = store
            .load_balancers
            .get_mut(&lb.name)
            .context("load balancer does not exist")?;
        // The attach response leaves the caller's copy without private
        // IPs; only the stored (re-fetched) object carries them.
        if !stored.private_net.iter().any(|n| n.network == network.id) {
            stored.private_net.push(LoadBalancerPrivateNet {
                network: network.id,
                ip: private_ip.to_string(),
            });
        }
        Ok(())
    }

    async fn add_target(&self, lb: &LoadBalancer, selector: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        let stored = store
            .load_balancers
            .get_mut(&lb.name)
            .context("load balancer does not exist")?;
        if !stored.targets.iter().any(|t| {
            t.label_selector
                .as_ref()
                .is_some_and(|ls| ls.selector == selector)
        }) {
            stored.targets.push(LoadBalancerTarget {
                target_type: "label_selector".to_string(),
                label_selector: Some(LabelSelector {
                    selector: selector.to_string(),
                }),
            });
        }
        Ok(())
    }

    async fn get_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>> {
        Ok(self.store.lock().unwrap().load_balancers.get(name).cloned())
    }

    async fn ensure_placement_group(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<PlacementGroup> {
        let mut store = self.store.lock().unwrap();
        if let Some(pg) = store.placement_groups.get(name) {
            return Ok(pg.clone());
        }
        store.next_id += 1;
        let pg = PlacementGroup {
            id: store.next_id,
            name: name.to_string(),
            group_type: "spread".to_string(),
            labels: labels.clone(),
        };
        store.placement_groups.insert(name.to_string(), pg.clone());
        *store.creates.entry("placement_group").or_default() += 1;
        Ok(pg)
    }

    async fn get_server_id(&self, name: &str) -> Result<Option<i64>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .servers
            .get(name)
            .map(|(id, _, _)| *id))
    }

    async fn get_server_ip(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .servers
            .get(name)
            .map(|(_, ip, _)| ip.clone()))
    }

    async fn create_server(&self, opts: CreateServerOpts) -> Result<i64> {
        let mut store = self.store.lock().unwrap();
        store.next_id += 1;
        let id = store.next_id;
        let ip = if opts.enable_public_ipv4 {
            format!("192.0.2.{}", id - 100)
        } else {
            opts.private_ip.clone()
        };
        store
            .servers
            .insert(opts.name.clone(), (id, ip.clone(), opts.labels.clone()));
        store.created_servers.push(opts);
        *store.creates.entry("server").or_default() += 1;
        // A fresh server boots into maintenance mode
        self.fleet.lock().unwrap().insert(ip, NodeMode::Maintenance);
        Ok(id)
    }

    async fn get_snapshot_by_labels(&self, labels: &HashMap<String, String>) -> Result<Option<Image>> {
        let mut store = self.store.lock().unwrap();
        store.snapshot_queries.push(labels.clone());
        Ok(self.has_snapshot.then(|| Image {
            id: 999,
            description: Some("talos".to_string()),
            labels: labels.clone(),
        }))
    }

    async fn set_server_rdns(&self, _server_id: i64, _ip: &str, _ptr: &str) -> Result<()> {
        Ok(())
    }

    async fn set_load_balancer_rdns(&self, _lb_id: i64, _ip: &str, _ptr: &str) -> Result<()> {
        Ok(())
    }

    async fn get_certificate(&self, name: &str) -> Result<Option<Certificate>> {
        Ok(self.store.lock().unwrap().certificates.get(name).cloned())
    }

    async fn ensure_certificate(
        &self,
        name: &str,
        _certificate: &str,
        _private_key: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Certificate> {
        let mut store = self.store.lock().unwrap();
        if let Some(cert) = store.certificates.get(name) {
            return Ok(cert.clone());
        }
        store.next_id += 1;
        let cert = Certificate {
            id: store.next_id,
            name: name.to_string(),
            labels: labels.clone(),
        };
        store.certificates.insert(name.to_string(), cert.clone());
        *store.creates.entry("certificate").or_default() += 1;
        Ok(cert)
    }

    async fn ensure_ssh_key(
        &self,
        name: &str,
        _public_key: &str,
        labels: &HashMap<String, String>,
    ) -> Result<SshKey> {
        let mut store = self.store.lock().unwrap();
        if let Some(key) = store.ssh_keys.get(name) {
            return Ok(key.clone());
        }
        store.next_id += 1;
        let key = SshKey {
            id: store.next_id,
            name: name.to_string(),
            labels: labels.clone(),
        };
        store.ssh_keys.insert(name.to_string(), key.clone());
        *store.creates.entry("ssh_key").or_default() += 1;
        Ok(key)
    }

    async fn delete_ssh_key(&self, name: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        store.ssh_keys.remove(name);
        store.deleted_ssh_keys.push(name.to_string());
        Ok(())
    }

    async fn cleanup_by_label(&self, labels: &HashMap<String, String>) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        store.cleanup_calls.push(labels.clone());
        store.networks.clear();
        store.firewalls.clear();
        store.load_balancers.clear();
        store.placement_groups.clear();
        store.servers.clear();
        store.certificates.clear();
        store.ssh_keys.clear();
        Ok(())
    }

    async fn get_public_ip(&self) -> Result<String> {
        Ok("198.51.100.99".to_string())
    }
}

// ---------------------------------------------------------------------------
// Fake Talos API
// ---------------------------------------------------------------------------

struct FakeTalos {
    fleet: Fleet,
    /// Endpoints apply_configuration was called against, in order
    apply_log: Mutex<Vec<(String, Instant)>>,
    bootstrap_calls: Mutex<Vec<String>>,
    /// Scripted TLS failures injected before VIP applies succeed
    tls_failures: AtomicU32,
    vip: Option<String>,
}

impl FakeTalos {
    fn new(fleet: Fleet) -> Self {
        Self {
            fleet,
            apply_log: Mutex::new(Vec::new()),
            bootstrap_calls: Mutex::new(Vec::new()),
            tls_failures: AtomicU32::new(0),
            vip: None,
        }
    }

    fn with_vip(fleet: Fleet, vip: &str) -> Self {
        Self {
            vip: Some(vip.to_string()),
            ..Self::new(fleet)
        }
    }

    fn mode(&self, ip: &str) -> NodeMode {
        if Some(ip) == self.vip.as_deref() {
            let fleet = self.fleet.lock().unwrap();
            if fleet.values().any(|m| *m == NodeMode::Maintenance) {
                return NodeMode::Maintenance;
            }
            if fleet.values().any(|m| *m == NodeMode::Configured) {
                return NodeMode::Configured;
            }
            return NodeMode::Offline;
        }
        self.fleet
            .lock()
            .unwrap()
            .get(ip)
            .copied()
            .unwrap_or(NodeMode::Offline)
    }

    fn apply_count(&self) -> usize {
        self.apply_log.lock().unwrap().len()
    }

    fn apply_gaps(&self) -> Vec<Duration> {
        let log = self.apply_log.lock().unwrap();
        log.windows(2).map(|w| w[1].1 - w[0].1).collect()
    }

    fn bootstrap_count(&self) -> usize {
        self.bootstrap_calls.lock().unwrap().len()
    }

    fn script_tls_failures(&self, n: u32) {
        self.tls_failures.store(n, Ordering::SeqCst);
    }

    fn set_mode(&self, ip: &str, mode: NodeMode) {
        self.fleet.lock().unwrap().insert(ip.to_string(), mode);
    }
}

#[async_trait]
impl TalosApi for FakeTalos {
    async fn probe_port(&self, ip: &str, _timeout: Duration) -> bool {
        self.mode(ip) != NodeMode::Offline
    }

    async fn version_insecure(&self, ip: &str) -> Result<()> {
        match self.mode(ip) {
            NodeMode::Maintenance => Err(anyhow!("API is not implemented in maintenance mode")),
            NodeMode::Configured => Err(anyhow!("remote error: tls: bad certificate")),
            NodeMode::Broken => Err(anyhow!("connection refused")),
            NodeMode::Offline => Err(anyhow!("connection refused")),
        }
    }

    async fn version_authenticated(&self, ip: &str, _client_config: &[u8]) -> Result<()> {
        match self.mode(ip) {
            NodeMode::Configured => Ok(()),
            NodeMode::Maintenance => Err(anyhow!("API is not implemented in maintenance mode")),
            _ => Err(anyhow!("connection refused")),
        }
    }

    async fn apply_configuration(&self, ip: &str, _machine_config: &[u8]) -> Result<()> {
        if Some(ip) == self.vip.as_deref() {
            if self
                .tls_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(anyhow!("remote error: tls: handshake failure"));
            }

            // The VIP routes to some maintenance-mode backend; it cannot
            // address a specific node.
            let mut fleet = self.fleet.lock().unwrap();
            let mut targets: Vec<&String> = fleet
                .iter()
                .filter(|(_, m)| **m == NodeMode::Maintenance)
                .map(|(ip, _)| ip)
                .collect();
            targets.sort();
            let target = targets
                .first()
                .map(|ip| (*ip).clone())
                .ok_or_else(|| anyhow!("remote error: tls: bad certificate"))?;
            fleet.insert(target, NodeMode::Configured);
        } else {
            match self.mode(ip) {
                NodeMode::Offline => return Err(anyhow!("connection refused")),
                _ => self.set_mode(ip, NodeMode::Configured),
            }
        }

        self.apply_log
            .lock()
            .unwrap()
            .push((ip.to_string(), Instant::now()));
        Ok(())
    }

    async fn bootstrap(&self, ip: &str, _client_config: &[u8]) -> Result<()> {
        self.bootstrap_calls.lock().unwrap().push(ip.to_string());
        Ok(())
    }

    async fn kubeconfig(&self, _ip: &str, _client_config: &[u8]) -> Result<Vec<u8>> {
        let fleet = self.fleet.lock().unwrap();
        if fleet.values().any(|m| *m == NodeMode::Configured) {
            Ok(b"apiVersion: v1\nkind: Config\n".to_vec())
        } else {
            Ok(Vec::new())
        }
    }
}

// ---------------------------------------------------------------------------
// Fake config producer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeProducer {
    endpoint: Mutex<Option<String>>,
}

#[async_trait]
impl TalosConfigProducer for FakeProducer {
    async fn generate_control_plane_config(
        &self,
        sans: &[String],
        hostname: &str,
        server_id: i64,
    ) -> Result<Vec<u8>> {
        Ok(format!("cp;{};{};{}", hostname, server_id, sans.join("|")).into_bytes())
    }

    async fn generate_worker_config(&self, hostname: &str, server_id: i64) -> Result<Vec<u8>> {
        Ok(format!("worker;{};{}", hostname, server_id).into_bytes())
    }

    async fn client_config(&self) -> Result<Vec<u8>> {
        Ok(b"context: test\ncontexts: {}\n".to_vec())
    }

    async fn set_endpoint(&self, url: &str) {
        *self.endpoint.lock().unwrap() = Some(url.to_string());
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn pool(name: &str, server_type: &str, count: u32) -> NodePool {
    NodePool {
        name: name.to_string(),
        server_type: server_type.to_string(),
        count,
        location: None,
        image: None,
        labels: HashMap::new(),
        placement_group: false,
        enable_public_ipv4: None,
        enable_public_ipv6: None,
    }
}

fn test_config(cp_count: u32) -> ClusterConfig {
    let mut config = ClusterConfig::example();
    config.cluster_name = "c1".to_string();
    config.control_planes = vec![pool("cp", "cpx21", cp_count)];
    config.workers = Vec::new();
    config.ssh_keys = vec!["ops-key".to_string()];
    config
}

fn fast_timeouts() -> Timeouts {
    Timeouts {
        port_wait: Duration::from_millis(10),
        dial: Duration::from_millis(10),
        node_ready: Duration::from_secs(2),
        node_ready_poll: Duration::from_millis(10),
        kubeconfig: Duration::from_secs(1),
        server_ip_retry_initial: Duration::from_millis(1),
        server_ip_retry_max_attempts: 3,
        reboot_initial_wait: Duration::from_millis(10),
        node_reboot_wait: Duration::from_millis(50),
        config_apply_retries: 3,
        config_retry_interval: Duration::from_millis(10),
    }
}

struct Harness {
    infra: Arc<FakeInfra>,
    talos: Arc<FakeTalos>,
    producer: Arc<FakeProducer>,
}

impl Harness {
    fn new(config: &ClusterConfig) -> Self {
        let fleet: Fleet = Arc::new(Mutex::new(HashMap::new()));
        let talos = if config.cluster_access == ClusterAccess::Private {
            FakeTalos::with_vip(fleet.clone(), LB_PUBLIC_IP)
        } else {
            FakeTalos::new(fleet.clone())
        };
        Self {
            infra: Arc::new(FakeInfra::new(fleet)),
            talos: Arc::new(talos),
            producer: Arc::new(FakeProducer::default()),
        }
    }

    fn context(&self, config: ClusterConfig) -> Context {
        let mut ctx = Context::new(
            config,
            self.infra.clone(),
            self.producer.clone(),
            self.talos.clone(),
        );
        ctx.timeouts = fast_timeouts();
        ctx
    }

    async fn apply(&self, config: ClusterConfig) -> Result<Context> {
        let mut ctx = self.context(config);
        Pipeline::provision().run(&mut ctx).await?;
        Ok(ctx)
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fresh_single_node_cluster() {
    let config = test_config(1);
    let harness = Harness::new(&config);
    let ctx = harness.apply(config).await.unwrap();

    // Network with one leaf subnet per role; the worker parent is never
    // created as a cloud subnet.
    let subnets = harness.infra.network_subnets("c1-network");
    assert_eq!(subnets, vec!["10.0.0.0/18", "10.0.64.0/18"]);

    assert_eq!(harness.infra.create_count("firewall"), 1);
    assert_eq!(harness.infra.create_count("placement_group"), 1);

    // Load balancer attached at the last usable host of its subnet,
    // fronting the control planes.
    let lb = harness.infra.load_balancer("c1-kube").unwrap();
    assert_eq!(lb.private_net[0].ip, "10.0.63.254");
    assert_eq!(lb.services.len(), 2);
    assert_eq!(
        lb.targets[0].label_selector.as_ref().unwrap().selector,
        "cluster=c1,role=control-plane"
    );

    // The re-fetched object (with private IPs) landed in state.
    let state_lb = ctx.state.load_balancer.as_ref().unwrap();
    assert_eq!(state_lb.private_ipv4s(), vec!["10.0.63.254"]);

    // One server at the first usable control-plane host above the gateway.
    let servers = harness.infra.created_servers();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].name, "c1-cp-1");
    assert_eq!(servers[0].private_ip, "10.0.64.2");
    assert_eq!(servers[0].labels["cluster"], "c1");
    assert_eq!(servers[0].labels["role"], "control-plane");

    // SANs cover every address the API is reached through.
    assert_eq!(ctx.state.sans, vec![LB_PUBLIC_IP, "10.0.63.254"]);
    assert_eq!(
        harness.producer.endpoint.lock().unwrap().as_deref(),
        Some("https://198.51.100.10:6443")
    );

    // Bootstrapped exactly once, marker written, kubeconfig fetched.
    assert_eq!(harness.talos.bootstrap_count(), 1);
    assert_eq!(harness.infra.create_count("certificate"), 1);
    assert!(!ctx.state.talos_config.is_empty());
    assert!(!ctx.state.kubeconfig.is_empty());
}

#[tokio::test]
async fn three_node_ha_cluster() {
    let config = test_config(3);
    let harness = Harness::new(&config);
    let ctx = harness.apply(config).await.unwrap();

    let servers = harness.infra.created_servers();
    let mut names: Vec<String> = servers.iter().map(|s| s.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["c1-cp-1", "c1-cp-2", "c1-cp-3"]);

    let mut ips: Vec<String> = servers.iter().map(|s| s.private_ip.clone()).collect();
    ips.sort();
    assert_eq!(ips, vec!["10.0.64.2", "10.0.64.3", "10.0.64.4"]);

    // etcd is initialized on exactly one node; all three are configured
    // before the phase finishes.
    assert_eq!(harness.talos.bootstrap_count(), 1);
    assert_eq!(harness.talos.apply_count(), 3);
    assert_eq!(ctx.state.control_plane_ips.len(), 3);
    assert!(!ctx.state.kubeconfig.is_empty());
}

#[tokio::test]
async fn second_apply_is_a_no_op() {
    let config = test_config(3);
    let harness = Harness::new(&config);
    harness.apply(config.clone()).await.unwrap();
    let counts_after_first = harness.infra.create_counts();

    let ctx = harness.apply(config).await.unwrap();

    assert_eq!(harness.infra.create_counts(), counts_after_first);
    assert_eq!(harness.talos.apply_count(), 3);
    assert_eq!(harness.talos.bootstrap_count(), 1);
    assert!(!ctx.state.kubeconfig.is_empty());
}

#[tokio::test]
async fn scale_out_configures_only_new_nodes() {
    let harness = Harness::new(&test_config(1));
    harness.apply(test_config(1)).await.unwrap();
    assert_eq!(harness.talos.apply_count(), 1);

    let ctx = harness.apply(test_config(3)).await.unwrap();

    // Two servers were added; the original node was classified as
    // configured and left alone.
    assert_eq!(harness.infra.create_count("server"), 3);
    assert_eq!(harness.talos.apply_count(), 3);
    assert_eq!(harness.talos.bootstrap_count(), 1);
    assert_eq!(harness.infra.create_count("certificate"), 1);
    assert_eq!(ctx.state.control_plane_ips.len(), 3);
    assert!(!ctx.state.kubeconfig.is_empty());
}

#[tokio::test]
async fn private_first_applies_sequentially_through_the_vip() {
    let mut config = test_config(3);
    config.cluster_access = ClusterAccess::Private;
    config.control_planes[0].enable_public_ipv4 = Some(false);
    config.control_planes[0].enable_public_ipv6 = Some(false);

    let harness = Harness::new(&config);
    harness.talos.script_tls_failures(1);
    let ctx = harness.apply(config).await.unwrap();

    // Every apply went to the VIP; the scripted TLS rejection was
    // retried rather than surfaced.
    let log = harness.talos.apply_log.lock().unwrap().clone();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|(ip, _)| ip == LB_PUBLIC_IP));

    // Sequential with a settling gap between applies.
    for gap in harness.talos.apply_gaps() {
        assert!(gap >= Duration::from_millis(40), "apply gap too small: {:?}", gap);
    }

    // All three nodes left maintenance mode.
    let fleet = harness.talos.fleet.lock().unwrap().clone();
    assert_eq!(
        fleet.values().filter(|m| **m == NodeMode::Configured).count(),
        3
    );
    drop(fleet);

    assert_eq!(harness.talos.bootstrap_count(), 1);
    assert!(!ctx.state.kubeconfig.is_empty());
}

#[tokio::test]
async fn maintenance_probe_classification() {
    let config = test_config(1);
    let harness = Harness::new(&config);
    let mut ctx = harness.context(config);
    ctx.state.talos_config = b"context: test\n".to_vec();

    // Maintenance-mode protocol signal on the insecure probe
    harness.talos.set_mode("10.0.64.2", NodeMode::Maintenance);
    assert!(bootstrap::is_in_maintenance_mode(&ctx, "10.0.64.2").await);

    // Authenticated success wins even though insecure would also answer
    harness.talos.set_mode("10.0.64.3", NodeMode::Configured);
    assert!(!bootstrap::is_in_maintenance_mode(&ctx, "10.0.64.3").await);

    // Unreachable port: offline, not maintenance
    assert!(!bootstrap::is_in_maintenance_mode(&ctx, "10.0.64.9").await);

    // Reachable but refusing both probes: unresponsive, not maintenance
    harness.talos.set_mode("10.0.64.4", NodeMode::Broken);
    assert!(!bootstrap::is_in_maintenance_mode(&ctx, "10.0.64.4").await);

    // A missing client config downgrades detection instead of crashing
    ctx.state.talos_config = Vec::new();
    assert!(!bootstrap::is_in_maintenance_mode(&ctx, "10.0.64.2").await);
}

#[tokio::test]
async fn destroy_sweeps_by_label() {
    let config = test_config(1);
    let harness = Harness::new(&config);
    harness.apply(config.clone()).await.unwrap();
    assert!(harness.infra.resource_count() > 0);

    let mut ctx = harness.context(config);
    Pipeline::destroy().run(&mut ctx).await.unwrap();

    let calls = harness.infra.cleanup_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], HashMap::from([("cluster".to_string(), "c1".to_string())]));
    assert_eq!(harness.infra.resource_count(), 0);
}

#[tokio::test]
async fn destroy_selector_carries_test_id() {
    let mut config = test_config(1);
    config.test_id = Some("t7".to_string());
    let harness = Harness::new(&config);

    let mut ctx = harness.context(config);
    Pipeline::destroy().run(&mut ctx).await.unwrap();

    let calls = harness.infra.cleanup_calls();
    assert_eq!(calls[0]["cluster"], "c1");
    assert_eq!(calls[0]["test-id"], "t7");
}

#[tokio::test]
async fn no_control_planes_means_no_load_balancer() {
    let mut config = test_config(0);
    config.control_planes = Vec::new();

    let harness = Harness::new(&config);
    let mut ctx = harness.context(config);
    // Run only the leading phases; bootstrap has nothing to do without
    // control planes.
    for phase in [
        basalt::pipeline::Phase::Validate,
        basalt::pipeline::Phase::Infrastructure,
        basalt::pipeline::Phase::Compute,
    ] {
        phase.provision(&mut ctx).await.unwrap();
    }

    assert_eq!(harness.infra.create_count("load_balancer"), 0);
    assert_eq!(harness.infra.create_count("server"), 0);
}

#[tokio::test]
async fn zero_count_pool_creates_no_servers() {
    let config = test_config(0);
    let harness = Harness::new(&config);
    let mut ctx = harness.context(config);
    for phase in [
        basalt::pipeline::Phase::Validate,
        basalt::pipeline::Phase::Infrastructure,
        basalt::pipeline::Phase::Compute,
    ] {
        phase.provision(&mut ctx).await.unwrap();
    }

    assert_eq!(harness.infra.create_count("server"), 0);
    assert!(ctx.state.control_plane_ips.is_empty());
    assert!(ctx.state.control_plane_server_ids.is_empty());
}

#[tokio::test]
async fn missing_snapshot_fails_compute() {
    let config = test_config(1);
    let fleet: Fleet = Arc::new(Mutex::new(HashMap::new()));
    let infra = Arc::new(FakeInfra::without_snapshot(fleet.clone()));
    let talos = Arc::new(FakeTalos::new(fleet));
    let producer = Arc::new(FakeProducer::default());

    let mut ctx = Context::new(config, infra, producer, talos);
    ctx.timeouts = fast_timeouts();

    let err = Pipeline::provision().run(&mut ctx).await.unwrap_err();
    assert!(format!("{:#}", err).contains("snapshot not found"));
}

#[tokio::test]
async fn snapshot_resolution_derives_architecture_from_server_type() {
    let mut config = test_config(1);
    config.control_planes[0].server_type = "cax31".to_string();

    let harness = Harness::new(&config);
    harness.apply(config).await.unwrap();

    let queries = harness.infra.store.lock().unwrap().snapshot_queries.clone();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0]["os"], "talos");
    assert_eq!(queries[0]["arch"], "arm64");
    assert_eq!(queries[0]["talos-version"], "v1.7.0");
}

#[tokio::test]
async fn ephemeral_ssh_key_is_created_and_removed() {
    let mut config = test_config(1);
    config.ssh_keys = Vec::new();

    let harness = Harness::new(&config);
    harness.apply(config).await.unwrap();

    assert_eq!(harness.infra.create_count("ssh_key"), 1);
    assert_eq!(harness.infra.deleted_ssh_keys(), vec!["c1-provision"]);

    let servers = harness.infra.created_servers();
    assert_eq!(servers[0].ssh_keys, vec!["c1-provision"]);
}

#[tokio::test]
async fn worker_pools_get_own_subnets_and_sharded_placement_groups() {
    let mut config = test_config(1);
    let mut workers = pool("pool", "cpx31", 12);
    workers.placement_group = true;
    config.workers = vec![workers];

    let harness = Harness::new(&config);
    let ctx = harness.apply(config).await.unwrap();

    let subnets = harness.infra.network_subnets("c1-network");
    assert!(subnets.contains(&"10.0.128.0/24".to_string()));

    // 12 workers with placement groups shard into ceil(12/10) = 2 groups
    // next to the control-plane pool's own group.
    assert_eq!(harness.infra.create_count("placement_group"), 3);

    // Workers land above the gateway offset in their pool subnet.
    let servers = harness.infra.created_servers();
    let w1 = servers.iter().find(|s| s.name == "c1-pool-1").unwrap();
    assert_eq!(w1.private_ip, "10.0.128.3");
    let w12 = servers.iter().find(|s| s.name == "c1-pool-12").unwrap();
    assert_eq!(w12.private_ip, "10.0.128.14");

    assert_eq!(ctx.state.worker_ips.len(), 12);
    assert_eq!(ctx.state.worker_server_ids.len(), 12);

    // Workers were configured too: 1 control plane + 12 workers.
    assert_eq!(harness.talos.apply_count(), 13);
}
