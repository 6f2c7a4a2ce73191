/// Talos machine API access (gRPC on port 50000)
///
/// Every node serves the same API in one of two security modes: a
/// freshly booted node accepts any TLS client but answers only a
/// restricted RPC set (maintenance mode); once a machine config has been
/// applied and the node rebooted, it requires the cluster's mutual-TLS
/// client credentials.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::path::PathBuf;
use std::time::Duration;
use talos_api_rs::api::version::VersionRequest;
use talos_api_rs::{ApplyConfigurationRequest, ApplyMode, BootstrapRequest, TalosClient, TalosClientConfig};
use url::Url;

/// Port the Talos API listens on
pub const TALOS_API_PORT: u16 = 50000;

/// Budget for a single Version probe
const PROBE_BUDGET: Duration = Duration::from_secs(10);

/// Whether an error message is the maintenance-mode protocol signal.
///
/// The API has no out-of-band way to report its security mode; this
/// substring in a `Version` error positively identifies a node that is
/// still unconfigured. Part of the external protocol contract.
pub fn is_maintenance_signal(message: &str) -> bool {
    message.contains("not implemented in maintenance mode")
}

/// Whether an error message indicates a TLS-level rejection rather than
/// a functional failure. Seen when the load balancer routes a request to
/// a node that already left maintenance mode.
pub fn is_tls_class_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["certificate", "handshake", "tls", "authentication"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// The RPC surface the bootstrap state machine consumes.
#[async_trait]
pub trait TalosApi: Send + Sync {
    /// TCP-probe the Talos API port.
    async fn probe_port(&self, ip: &str, timeout: Duration) -> bool;

    /// Call `Version` over an unverified TLS connection.
    async fn version_insecure(&self, ip: &str) -> Result<()>;

    /// Call `Version` with the cluster's mutual-TLS client credentials.
    async fn version_authenticated(&self, ip: &str, client_config: &[u8]) -> Result<()>;

    /// Apply a machine config over an unverified connection, rebooting
    /// the node into configured mode.
    async fn apply_configuration(&self, ip: &str, machine_config: &[u8]) -> Result<()>;

    /// Initialize etcd. Single-node, once per cluster lifetime.
    async fn bootstrap(&self, ip: &str, client_config: &[u8]) -> Result<()>;

    /// Fetch the Kubernetes client config from a control plane.
    async fn kubeconfig(&self, ip: &str, client_config: &[u8]) -> Result<Vec<u8>>;
}

/// Production `TalosApi` over tonic channels.
pub struct GrpcTalos {
    dial_timeout: Duration,
}

impl GrpcTalos {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }

    /// Endpoint for a node or VIP address, rejecting anything that does
    /// not form a valid URL (bare IPv6 addresses, junk hostnames).
    fn endpoint(ip: &str) -> Result<String> {
        let endpoint = format!("https://{}:{}", ip, TALOS_API_PORT);
        Url::parse(&endpoint).with_context(|| format!("invalid Talos API endpoint {}", endpoint))?;
        Ok(endpoint)
    }

    async fn insecure_client(&self, ip: &str) -> Result<TalosClient> {
        let config = TalosClientConfig::builder(Self::endpoint(ip)?)
            .insecure()
            .connect_timeout(self.dial_timeout)
            .request_timeout(PROBE_BUDGET)
            .build();
        TalosClient::new(config)
            .await
            .map_err(|e| anyhow!("failed to connect to {}: {}", ip, e))
    }

    async fn authenticated_client(&self, ip: &str, client_config: &[u8]) -> Result<(TalosClient, tempfile::TempDir)> {
        let staged = StagedCredentials::from_talosconfig(client_config)?;
        let config = TalosClientConfig::builder(Self::endpoint(ip)?)
            .ca_cert(staged.ca.to_string_lossy())
            .client_cert(staged.crt.to_string_lossy())
            .client_key(staged.key.to_string_lossy())
            .connect_timeout(self.dial_timeout)
            .request_timeout(PROBE_BUDGET)
            .build();
        let client = TalosClient::new(config)
            .await
            .map_err(|e| anyhow!("failed to connect to {}: {}", ip, e))?;
        Ok((client, staged.dir))
    }
}

#[async_trait]
impl TalosApi for GrpcTalos {
    async fn probe_port(&self, ip: &str, timeout: Duration) -> bool {
        let addr = format!("{}:{}", ip, TALOS_API_PORT);
        matches!(
            tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }

    async fn version_insecure(&self, ip: &str) -> Result<()> {
        tokio::time::timeout(PROBE_BUDGET, async {
            let client = self.insecure_client(ip).await?;
            client
                .version()
                .version(VersionRequest { client: false })
                .await
                .map_err(|status| anyhow!("{}", status.message().to_string()))?;
            Ok(())
        })
        .await
        .map_err(|_| anyhow!("timeout waiting for {}", ip))?
    }

    async fn version_authenticated(&self, ip: &str, client_config: &[u8]) -> Result<()> {
        tokio::time::timeout(PROBE_BUDGET, async {
            let (client, _creds) = self.authenticated_client(ip, client_config).await?;
            client
                .version()
                .version(VersionRequest { client: false })
                .await
                .map_err(|status| anyhow!("{}", status.message().to_string()))?;
            Ok(())
        })
        .await
        .map_err(|_| anyhow!("timeout waiting for {}", ip))?
    }

    async fn apply_configuration(&self, ip: &str, machine_config: &[u8]) -> Result<()> {
        let client = self.insecure_client(ip).await?;
        let request = ApplyConfigurationRequest::builder()
            .config_bytes(machine_config.to_vec())
            .mode(ApplyMode::Reboot)
            .build();
        client
            .apply_configuration(request)
            .await
            .map_err(|e| anyhow!("failed to apply configuration to {}: {}", ip, e))?;
        Ok(())
    }

    async fn bootstrap(&self, ip: &str, client_config: &[u8]) -> Result<()> {
        let (client, _creds) = self.authenticated_client(ip, client_config).await?;
        client
            .bootstrap(BootstrapRequest::new())
            .await
            .map_err(|e| anyhow!("failed to bootstrap etcd on {}: {}", ip, e))?;
        Ok(())
    }

    async fn kubeconfig(&self, ip: &str, client_config: &[u8]) -> Result<Vec<u8>> {
        let (client, _creds) = self.authenticated_client(ip, client_config).await?;
        let response = client
            .kubeconfig()
            .await
            .map_err(|e| anyhow!("failed to fetch kubeconfig from {}: {}", ip, e))?;
        Ok(response.data)
    }
}

/// Client credentials from a talosconfig document, staged on disk for
/// the TLS stack. The directory is removed when dropped.
#[derive(Debug)]
struct StagedCredentials {
    dir: tempfile::TempDir,
    ca: PathBuf,
    crt: PathBuf,
    key: PathBuf,
}

impl StagedCredentials {
    fn from_talosconfig(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw).context("talosconfig is not valid UTF-8")?;
        let parsed = talos_api_rs::config::TalosConfig::from_yaml(text)
            .map_err(|e| anyhow!("failed to parse talosconfig: {}", e))?;

        let context = parsed
            .active_context()
            .or_else(|| parsed.contexts.values().next())
            .context("talosconfig has no contexts")?;

        let ca = context.ca.as_deref().context("talosconfig context has no CA certificate")?;
        let crt = context.crt.as_deref().context("talosconfig context has no client certificate")?;
        let key = context.key.as_deref().context("talosconfig context has no client key")?;

        let dir = tempfile::tempdir().context("failed to create credentials directory")?;
        let write = |name: &str, content: &str| -> Result<PathBuf> {
            let path = dir.path().join(name);
            std::fs::write(&path, decode_cert_material(content)?)
                .with_context(|| format!("failed to stage {}", name))?;
            Ok(path)
        };

        let ca = write("ca.crt", ca)?;
        let crt = write("client.crt", crt)?;
        let key = write("client.key", key)?;

        Ok(Self { dir, ca, crt, key })
    }
}

/// Talosconfig stores certificates base64-encoded; accept raw PEM too.
fn decode_cert_material(content: &str) -> Result<Vec<u8>> {
    if content.starts_with("-----BEGIN") {
        return Ok(content.as_bytes().to_vec());
    }
    BASE64
        .decode(content)
        .or_else(|_| BASE64.decode(content.replace('\n', "")))
        .context("failed to decode certificate material")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maintenance_signal_detection() {
        assert!(is_maintenance_signal(
            "rpc error: API is not implemented in maintenance mode"
        ));
        assert!(!is_maintenance_signal("connection refused"));
    }

    #[test]
    fn test_tls_class_errors() {
        assert!(is_tls_class_error("remote error: tls: bad certificate"));
        assert!(is_tls_class_error("TLS handshake failed"));
        assert!(is_tls_class_error("authentication required"));
        assert!(!is_tls_class_error("connection refused"));
        assert!(!is_tls_class_error("timeout waiting for node"));
    }

    #[test]
    fn test_endpoint_validation() {
        assert_eq!(
            GrpcTalos::endpoint("192.0.2.7").unwrap(),
            "https://192.0.2.7:50000"
        );
        assert!(GrpcTalos::endpoint("not a host").is_err());
    }

    #[test]
    fn test_decode_cert_material_base64() {
        let encoded = BASE64.encode("-----BEGIN CERTIFICATE-----");
        let decoded = decode_cert_material(&encoded).unwrap();
        assert_eq!(decoded, b"-----BEGIN CERTIFICATE-----");
    }

    #[test]
    fn test_decode_cert_material_raw_pem() {
        let pem = "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----";
        assert_eq!(decode_cert_material(pem).unwrap(), pem.as_bytes());
    }

    #[test]
    fn test_staged_credentials_from_talosconfig() {
        let ca = BASE64.encode("ca-pem");
        let crt = BASE64.encode("crt-pem");
        let key = BASE64.encode("key-pem");
        let talosconfig = format!(
            "context: c1\ncontexts:\n  c1:\n    endpoints:\n      - 10.0.0.1\n    ca: {}\n    crt: {}\n    key: {}\n",
            ca, crt, key
        );

        let staged = StagedCredentials::from_talosconfig(talosconfig.as_bytes()).unwrap();
        assert_eq!(std::fs::read(&staged.ca).unwrap(), b"ca-pem");
        assert_eq!(std::fs::read(&staged.crt).unwrap(), b"crt-pem");
        assert_eq!(std::fs::read(&staged.key).unwrap(), b"key-pem");
    }

    #[test]
    fn test_staged_credentials_requires_context() {
        let err = StagedCredentials::from_talosconfig(b"contexts: {}").unwrap_err();
        assert!(err.to_string().contains("no contexts"));
    }
}
