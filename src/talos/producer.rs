/// Machine-config generation for Talos nodes
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::utils::command::{ensure_tool_installed, run_tool};

/// Produces Talos machine configs and the cluster client config.
///
/// The per-node inputs are the certificate SANs, the node hostname and
/// the cloud server id; everything else (cluster secrets, versions, the
/// canonical API endpoint) is producer state.
#[async_trait]
pub trait TalosConfigProducer: Send + Sync {
    async fn generate_control_plane_config(
        &self,
        sans: &[String],
        hostname: &str,
        server_id: i64,
    ) -> Result<Vec<u8>>;

    async fn generate_worker_config(&self, hostname: &str, server_id: i64) -> Result<Vec<u8>>;

    /// The mutual-TLS client config (talosconfig) for this cluster.
    async fn client_config(&self) -> Result<Vec<u8>>;

    /// Set the canonical cluster endpoint, e.g. `https://1.2.3.4:6443`.
    async fn set_endpoint(&self, url: &str);
}

/// `TalosConfigProducer` backed by `talosctl gen config`.
///
/// One generation run produces the control-plane and worker base
/// documents plus the talosconfig; per-node documents are the base with
/// the node identity patched in.
pub struct TalosctlProducer {
    cluster_name: String,
    kubernetes_version: String,
    cancel: CancellationToken,
    state: Mutex<ProducerState>,
}

struct ProducerState {
    endpoint: Option<String>,
    generated: Option<GeneratedBase>,
}

struct GeneratedBase {
    // Keeps the output directory (and secrets.yaml) alive for regeneration
    _dir: tempfile::TempDir,
    endpoint: String,
    sans: Vec<String>,
    control_plane: Vec<u8>,
    worker: Vec<u8>,
    talosconfig: Vec<u8>,
}

impl TalosctlProducer {
    pub fn new(cluster_name: String, kubernetes_version: String) -> Self {
        Self {
            cluster_name,
            kubernetes_version,
            cancel: CancellationToken::new(),
            state: Mutex::new(ProducerState {
                endpoint: None,
                generated: None,
            }),
        }
    }

    /// Tie generation runs to the pipeline's cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Check that talosctl is available before the pipeline starts.
    pub async fn check_talosctl_installed() -> Result<()> {
        ensure_tool_installed(
            "talosctl",
            &["version", "--client"],
            "https://www.talos.dev/latest/talos-guides/install/talosctl/",
        )
        .await?;
        Ok(())
    }

    async fn generate_base(&self, state: &mut ProducerState, sans: &[String]) -> Result<()> {
        let endpoint = state
            .endpoint
            .clone()
            .context("cluster endpoint not set before config generation")?;
        Url::parse(&endpoint).context("cluster endpoint is not a valid URL")?;

        if let Some(generated) = &state.generated {
            if generated.endpoint == endpoint && generated.sans == sans {
                return Ok(());
            }
        }

        info!(
            "Generating Talos machine configs for endpoint {} ({} SANs)",
            endpoint,
            sans.len()
        );

        let dir = match state.generated.take() {
            // Reuse the directory so secrets.yaml keeps the cluster identity
            Some(previous) => previous._dir,
            None => tempfile::tempdir().context("failed to create config output directory")?,
        };
        let dir_path = dir.path().to_path_buf();

        let kubernetes_version = self.kubernetes_version.trim_start_matches('v').to_string();
        let mut args: Vec<String> = vec![
            "gen".into(),
            "config".into(),
            self.cluster_name.clone(),
            endpoint.clone(),
            "--output-dir".into(),
            dir_path.to_string_lossy().into_owned(),
            "--kubernetes-version".into(),
            kubernetes_version,
            "--force".into(),
            // Keep documents small enough for cloud user-data limits
            "--with-docs=false".into(),
            "--with-examples=false".into(),
        ];

        if !sans.is_empty() {
            args.push("--additional-sans".into());
            args.push(sans.join(","));
        }

        let secrets_path = dir_path.join("secrets.yaml");
        if secrets_path.exists() {
            args.push("--with-secrets".into());
            args.push(secrets_path.to_string_lossy().into_owned());
        }

        run_tool("talosctl", args, &self.cancel)
            .await
            .context("talosctl gen config failed")?;

        let control_plane = tokio::fs::read(dir_path.join("controlplane.yaml"))
            .await
            .context("failed to read generated controlplane.yaml")?;
        let worker = tokio::fs::read(dir_path.join("worker.yaml"))
            .await
            .context("failed to read generated worker.yaml")?;
        let talosconfig = tokio::fs::read(dir_path.join("talosconfig"))
            .await
            .context("failed to read generated talosconfig")?;

        state.generated = Some(GeneratedBase {
            _dir: dir,
            endpoint,
            sans: sans.to_vec(),
            control_plane,
            worker,
            talosconfig,
        });

        Ok(())
    }
}

#[async_trait]
impl TalosConfigProducer for TalosctlProducer {
    async fn generate_control_plane_config(
        &self,
        sans: &[String],
        hostname: &str,
        server_id: i64,
    ) -> Result<Vec<u8>> {
        let mut state = self.state.lock().await;
        self.generate_base(&mut state, sans).await?;
        let base = state
            .generated
            .as_ref()
            .context("machine configs were not generated")?;
        patch_node_identity(&base.control_plane, hostname, server_id)
    }

    async fn generate_worker_config(&self, hostname: &str, server_id: i64) -> Result<Vec<u8>> {
        let mut state = self.state.lock().await;
        let sans = state
            .generated
            .as_ref()
            .map(|g| g.sans.clone())
            .unwrap_or_default();
        self.generate_base(&mut state, &sans).await?;
        let base = state
            .generated
            .as_ref()
            .context("machine configs were not generated")?;
        patch_node_identity(&base.worker, hostname, server_id)
    }

    async fn client_config(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock().await;
        let sans = state
            .generated
            .as_ref()
            .map(|g| g.sans.clone())
            .unwrap_or_default();
        self.generate_base(&mut state, &sans).await?;
        let base = state
            .generated
            .as_ref()
            .context("machine configs were not generated")?;
        Ok(base.talosconfig.clone())
    }

    async fn set_endpoint(&self, url: &str) {
        let mut state = self.state.lock().await;
        state.endpoint = Some(url.to_string());
    }
}

/// Patch the node hostname and cloud server id into a generated machine
/// config document.
fn patch_node_identity(config: &[u8], hostname: &str, server_id: i64) -> Result<Vec<u8>> {
    let mut doc: Value =
        serde_yaml::from_slice(config).context("generated machine config is not valid YAML")?;

    let machine = doc
        .get_mut("machine")
        .and_then(|m| m.as_mapping_mut())
        .context("machine config has no 'machine' section")?;

    let network_key = Value::String("network".to_string());
    if !machine.contains_key(&network_key) {
        machine.insert(network_key.clone(), Value::Mapping(Mapping::new()));
    }
    machine
        .get_mut(&network_key)
        .and_then(|v| v.as_mapping_mut())
        .context("machine.network is not a mapping")?
        .insert(
            Value::String("hostname".to_string()),
            Value::String(hostname.to_string()),
        );

    let labels_key = Value::String("nodeLabels".to_string());
    if !machine.contains_key(&labels_key) {
        machine.insert(labels_key.clone(), Value::Mapping(Mapping::new()));
    }
    machine
        .get_mut(&labels_key)
        .and_then(|v| v.as_mapping_mut())
        .context("machine.nodeLabels is not a mapping")?
        .insert(
            Value::String("instance-id".to_string()),
            Value::String(server_id.to_string()),
        );

    let rendered = serde_yaml::to_string(&doc).context("failed to render machine config")?;
    Ok(rendered.into_bytes())
}
