/// Hetzner Cloud API client
use reqwest::{header, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

use super::models::*;

const HCLOUD_API_BASE: &str = "https://api.hetzner.cloud/v1";

/// How often a pending action is re-read while waiting for it
const ACTION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Errors surfaced by the Hetzner Cloud API client
#[derive(Debug, Error)]
pub enum HcloudError {
    #[error("API token is not a valid header value")]
    InvalidToken,

    #[error("could not build HTTP client: {0}")]
    ClientSetup(#[source] reqwest::Error),

    #[error("{method} {endpoint}: {source}")]
    Transport {
        method: Method,
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The API answered with its structured error envelope
    #[error("{method} {endpoint} rejected with {code}: {message}")]
    Api {
        method: Method,
        endpoint: String,
        code: String,
        message: String,
    },

    #[error("{method} {endpoint} answered {status} without an error envelope")]
    UnexpectedStatus {
        method: Method,
        endpoint: String,
        status: StatusCode,
    },

    #[error("{method} {endpoint}: response body did not match the expected shape: {source}")]
    Decode {
        method: Method,
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("action {action_id} failed: {message}")]
    ActionFailed { action_id: i64, message: String },

    #[error("action {action_id} did not settle within {budget:?}")]
    ActionTimedOut { action_id: i64, budget: Duration },
}

impl HcloudError {
    /// Whether the API refused because the resource still has users,
    /// e.g. a firewall whose servers are still tearing down.
    pub fn is_resource_in_use(&self) -> bool {
        matches!(self, HcloudError::Api { code, .. } if code == "resource_in_use" || code == "protected")
    }
}

pub type HcloudResult<T> = Result<T, HcloudError>;

/// Main Hetzner Cloud API client
#[derive(Clone)]
pub struct HetznerCloudClient {
    http: Client,
    api_base: String,
}

impl HetznerCloudClient {
    /// Create a new Hetzner Cloud API client
    pub fn new(api_token: String) -> HcloudResult<Self> {
        Self::with_base(api_token, HCLOUD_API_BASE.to_string())
    }

    /// Create a client against a non-default API base (tests)
    pub fn with_base(api_token: String, api_base: String) -> HcloudResult<Self> {
        let mut auth = header::HeaderValue::from_str(&format!("Bearer {}", api_token))
            .map_err(|_| HcloudError::InvalidToken)?;
        auth.set_sensitive(true);

        let mut headers = header::HeaderMap::new();
        headers.insert(header::AUTHORIZATION, auth);

        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(HcloudError::ClientSetup)?;

        Ok(Self { http, api_base })
    }

    /// One round-trip to the API: send, sort the response into the
    /// structured-error / unexpected-status / decode buckets.
    async fn roundtrip<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
    ) -> HcloudResult<T> {
        let url = format!("{}/{}", self.api_base, endpoint);
        trace!("{} {}", method, url);

        let mut request = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|source| HcloudError::Transport {
            method: method.clone(),
            endpoint: endpoint.to_string(),
            source,
        })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|source| HcloudError::Transport {
            method: method.clone(),
            endpoint: endpoint.to_string(),
            source,
        })?;

        if !status.is_success() {
            return Err(match serde_json::from_slice::<ErrorResponse>(&bytes) {
                Ok(envelope) => HcloudError::Api {
                    method,
                    endpoint: endpoint.to_string(),
                    code: envelope.error.code,
                    message: envelope.error.message,
                },
                Err(_) => HcloudError::UnexpectedStatus {
                    method,
                    endpoint: endpoint.to_string(),
                    status,
                },
            });
        }

        serde_json::from_slice(&bytes).map_err(|source| HcloudError::Decode {
            method,
            endpoint: endpoint.to_string(),
            source,
        })
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> HcloudResult<T> {
        self.roundtrip::<(), T>(Method::GET, endpoint, None).await
    }

    pub(crate) async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> HcloudResult<T> {
        self.roundtrip(Method::POST, endpoint, Some(body)).await
    }

    /// Deletion responses carry at most an action we do not track, and
    /// some endpoints answer with an empty body; only the error
    /// envelope matters.
    pub(crate) async fn delete(&self, endpoint: &str) -> HcloudResult<()> {
        let url = format!("{}/{}", self.api_base, endpoint);
        trace!("DELETE {}", url);

        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|source| HcloudError::Transport {
                method: Method::DELETE,
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let bytes = response.bytes().await.map_err(|source| HcloudError::Transport {
            method: Method::DELETE,
            endpoint: endpoint.to_string(),
            source,
        })?;

        Err(match serde_json::from_slice::<ErrorResponse>(&bytes) {
            Ok(envelope) => HcloudError::Api {
                method: Method::DELETE,
                endpoint: endpoint.to_string(),
                code: envelope.error.code,
                message: envelope.error.message,
            },
            Err(_) => HcloudError::UnexpectedStatus {
                method: Method::DELETE,
                endpoint: endpoint.to_string(),
                status,
            },
        })
    }

    /// Poll an asynchronous action until it settles. Mutations answer
    /// immediately but converge in the background.
    pub async fn wait_for_action(&self, action_id: i64, budget: Duration) -> HcloudResult<Action> {
        let deadline = Instant::now() + budget;

        loop {
            let response: ActionResponse = self.get(&format!("actions/{}", action_id)).await?;
            let action = response.action;

            match action.status.as_str() {
                "success" => return Ok(action),
                "error" => {
                    let message = action
                        .error
                        .map(|e| format!("{} ({})", e.message, e.code))
                        .unwrap_or_else(|| "no error details".to_string());
                    return Err(HcloudError::ActionFailed { action_id, message });
                }
                // "running", or whatever the API grows later
                other => {
                    trace!("action {} is {} at {}%", action_id, other, action.progress);
                }
            }

            if Instant::now() >= deadline {
                return Err(HcloudError::ActionTimedOut { action_id, budget });
            }
            tokio::time::sleep(ACTION_POLL_INTERVAL).await;
        }
    }

    // ---- servers ----

    /// Get a server by its exact name
    pub async fn get_server_by_name(&self, name: &str) -> HcloudResult<Option<Server>> {
        let response: ServerListResponse = self.get(&format!("servers?name={}", name)).await?;
        Ok(response.servers.into_iter().find(|s| s.name == name))
    }

    /// List servers matching a label selector
    pub async fn list_servers_by_selector(&self, selector: &str) -> HcloudResult<Vec<Server>> {
        let response: ServerListResponse = self
            .get(&format!("servers?label_selector={}", urlencode(selector)))
            .await?;
        Ok(response.servers)
    }

    /// Create a new server
    pub async fn create_server(
        &self,
        request: &CreateServerRequest,
    ) -> HcloudResult<CreateServerResponse> {
        self.post("servers", request).await
    }

    /// Delete a server
    pub async fn delete_server(&self, server_id: i64) -> HcloudResult<()> {
        self.delete(&format!("servers/{}", server_id)).await
    }

    /// Set the reverse-DNS pointer for one of a server's IPs
    pub async fn change_server_dns_ptr(&self, server_id: i64, ip: &str, ptr: &str) -> HcloudResult<()> {
        let request = ChangeDnsPtrRequest {
            ip: ip.to_string(),
            dns_ptr: Some(ptr.to_string()),
        };
        let _: ActionResponse = self
            .post(&format!("servers/{}/actions/change_dns_ptr", server_id), &request)
            .await?;
        Ok(())
    }

    // ---- networks ----

    /// Get a network by its exact name
    pub async fn get_network_by_name(&self, name: &str) -> HcloudResult<Option<Network>> {
        let response: NetworkListResponse = self.get(&format!("networks?name={}", name)).await?;
        Ok(response.networks.into_iter().find(|n| n.name == name))
    }

    /// List networks matching a label selector
    pub async fn list_networks_by_selector(&self, selector: &str) -> HcloudResult<Vec<Network>> {
        let response: NetworkListResponse = self
            .get(&format!("networks?label_selector={}", urlencode(selector)))
            .await?;
        Ok(response.networks)
    }

    /// Create a new network
    pub async fn create_network(&self, request: &CreateNetworkRequest) -> HcloudResult<Network> {
        let response: CreateNetworkResponse = self.post("networks", request).await?;
        Ok(response.network)
    }

    /// Delete a network
    pub async fn delete_network(&self, network_id: i64) -> HcloudResult<()> {
        self.delete(&format!("networks/{}", network_id)).await
    }

    /// Add a subnet to an existing network
    pub async fn add_subnet(&self, network_id: i64, subnet: &SubnetRequest) -> HcloudResult<()> {
        let response: ActionResponse = self
            .post(&format!("networks/{}/actions/add_subnet", network_id), subnet)
            .await?;
        self.wait_for_action(response.action.id, Duration::from_secs(60))
            .await?;
        Ok(())
    }

    // ---- firewalls ----

    /// Get a firewall by its exact name
    pub async fn get_firewall_by_name(&self, name: &str) -> HcloudResult<Option<Firewall>> {
        let response: FirewallListResponse = self.get(&format!("firewalls?name={}", name)).await?;
        Ok(response.firewalls.into_iter().find(|f| f.name == name))
    }

    /// List firewalls matching a label selector
    pub async fn list_firewalls_by_selector(&self, selector: &str) -> HcloudResult<Vec<Firewall>> {
        let response: FirewallListResponse = self
            .get(&format!("firewalls?label_selector={}", urlencode(selector)))
            .await?;
        Ok(response.firewalls)
    }

    /// Create a firewall
    pub async fn create_firewall(&self, request: &CreateFirewallRequest) -> HcloudResult<Firewall> {
        let response: CreateFirewallResponse = self.post("firewalls", request).await?;
        Ok(response.firewall)
    }

    /// Replace the rule set of an existing firewall
    pub async fn set_firewall_rules(
        &self,
        firewall_id: i64,
        rules: &[FirewallRule],
    ) -> HcloudResult<()> {
        #[derive(Serialize)]
        struct SetRulesRequest<'a> {
            rules: &'a [FirewallRule],
        }
        let _: ActionsResponse = self
            .post(
                &format!("firewalls/{}/actions/set_rules", firewall_id),
                &SetRulesRequest { rules },
            )
            .await?;
        Ok(())
    }

    /// Apply a firewall to all servers matching a label selector
    pub async fn apply_firewall_to_selector(
        &self,
        firewall_id: i64,
        selector: &str,
    ) -> HcloudResult<()> {
        let request = ApplyToResourcesRequest {
            apply_to: vec![FirewallResourceRef {
                resource_type: "label_selector".to_string(),
                label_selector: Some(LabelSelector {
                    selector: selector.to_string(),
                }),
            }],
        };
        let _: ActionsResponse = self
            .post(
                &format!("firewalls/{}/actions/apply_to_resources", firewall_id),
                &request,
            )
            .await?;
        Ok(())
    }

    /// Delete a firewall
    pub async fn delete_firewall(&self, firewall_id: i64) -> HcloudResult<()> {
        self.delete(&format!("firewalls/{}", firewall_id)).await
    }

    // ---- load balancers ----

    /// Get a load balancer by its exact name
    pub async fn get_load_balancer_by_name(&self, name: &str) -> HcloudResult<Option<LoadBalancer>> {
        let response: LoadBalancerListResponse =
            self.get(&format!("load_balancers?name={}", name)).await?;
        Ok(response.load_balancers.into_iter().find(|lb| lb.name == name))
    }

    /// List load balancers matching a label selector
    pub async fn list_load_balancers_by_selector(
        &self,
        selector: &str,
    ) -> HcloudResult<Vec<LoadBalancer>> {
        let response: LoadBalancerListResponse = self
            .get(&format!("load_balancers?label_selector={}", urlencode(selector)))
            .await?;
        Ok(response.load_balancers)
    }

    /// Create a load balancer
    pub async fn create_load_balancer(
        &self,
        request: &CreateLoadBalancerRequest,
    ) -> HcloudResult<LoadBalancer> {
        let response: CreateLoadBalancerResponse = self.post("load_balancers", request).await?;
        Ok(response.load_balancer)
    }

    /// Add a service (listener + health check) to a load balancer
    pub async fn add_load_balancer_service(
        &self,
        lb_id: i64,
        service: &LoadBalancerService,
    ) -> HcloudResult<()> {
        let response: ActionResponse = self
            .post(&format!("load_balancers/{}/actions/add_service", lb_id), service)
            .await?;
        self.wait_for_action(response.action.id, Duration::from_secs(60))
            .await?;
        Ok(())
    }

    /// Attach a load balancer to a private network at a fixed IP
    pub async fn attach_load_balancer_to_network(
        &self,
        lb_id: i64,
        network_id: i64,
        ip: &str,
    ) -> HcloudResult<()> {
        #[derive(Serialize)]
        struct AttachRequest {
            network: i64,
            ip: String,
        }
        let response: ActionResponse = self
            .post(
                &format!("load_balancers/{}/actions/attach_to_network", lb_id),
                &AttachRequest {
                    network: network_id,
                    ip: ip.to_string(),
                },
            )
            .await?;
        self.wait_for_action(response.action.id, Duration::from_secs(60))
            .await?;
        Ok(())
    }

    /// Add a label-selector target to a load balancer
    pub async fn add_load_balancer_target(&self, lb_id: i64, selector: &str) -> HcloudResult<()> {
        #[derive(Serialize)]
        struct AddTargetRequest {
            #[serde(rename = "type")]
            target_type: String,
            label_selector: LabelSelector,
            use_private_ip: bool,
        }
        let response: ActionResponse = self
            .post(
                &format!("load_balancers/{}/actions/add_target", lb_id),
                &AddTargetRequest {
                    target_type: "label_selector".to_string(),
                    label_selector: LabelSelector {
                        selector: selector.to_string(),
                    },
                    use_private_ip: false,
                },
            )
            .await?;
        self.wait_for_action(response.action.id, Duration::from_secs(60))
            .await?;
        Ok(())
    }

    /// Set the reverse-DNS pointer for a load balancer IP
    pub async fn change_load_balancer_dns_ptr(
        &self,
        lb_id: i64,
        ip: &str,
        ptr: &str,
    ) -> HcloudResult<()> {
        let request = ChangeDnsPtrRequest {
            ip: ip.to_string(),
            dns_ptr: Some(ptr.to_string()),
        };
        let _: ActionResponse = self
            .post(
                &format!("load_balancers/{}/actions/change_dns_ptr", lb_id),
                &request,
            )
            .await?;
        Ok(())
    }

    /// Delete a load balancer
    pub async fn delete_load_balancer(&self, lb_id: i64) -> HcloudResult<()> {
        self.delete(&format!("load_balancers/{}", lb_id)).await
    }

    // ---- placement groups ----

    /// Get a placement group by its exact name
    pub async fn get_placement_group_by_name(&self, name: &str) -> HcloudResult<Option<PlacementGroup>> {
        let response: PlacementGroupListResponse =
            self.get(&format!("placement_groups?name={}", name)).await?;
        Ok(response
            .placement_groups
            .into_iter()
            .find(|pg| pg.name == name))
    }

    /// List placement groups matching a label selector
    pub async fn list_placement_groups_by_selector(
        &self,
        selector: &str,
    ) -> HcloudResult<Vec<PlacementGroup>> {
        let response: PlacementGroupListResponse = self
            .get(&format!("placement_groups?label_selector={}", urlencode(selector)))
            .await?;
        Ok(response.placement_groups)
    }

    /// Create a placement group
    pub async fn create_placement_group(
        &self,
        request: &CreatePlacementGroupRequest,
    ) -> HcloudResult<PlacementGroup> {
        let response: CreatePlacementGroupResponse = self.post("placement_groups", request).await?;
        Ok(response.placement_group)
    }

    /// Delete a placement group
    pub async fn delete_placement_group(&self, pg_id: i64) -> HcloudResult<()> {
        self.delete(&format!("placement_groups/{}", pg_id)).await
    }

    // ---- certificates ----

    /// Get a certificate by its exact name
    pub async fn get_certificate_by_name(&self, name: &str) -> HcloudResult<Option<Certificate>> {
        let response: CertificateListResponse =
            self.get(&format!("certificates?name={}", name)).await?;
        Ok(response.certificates.into_iter().find(|c| c.name == name))
    }

    /// List certificates matching a label selector
    pub async fn list_certificates_by_selector(&self, selector: &str) -> HcloudResult<Vec<Certificate>> {
        let response: CertificateListResponse = self
            .get(&format!("certificates?label_selector={}", urlencode(selector)))
            .await?;
        Ok(response.certificates)
    }

    /// Upload a certificate
    pub async fn create_certificate(
        &self,
        request: &CreateCertificateRequest,
    ) -> HcloudResult<Certificate> {
        let response: CreateCertificateResponse = self.post("certificates", request).await?;
        Ok(response.certificate)
    }

    /// Delete a certificate
    pub async fn delete_certificate(&self, cert_id: i64) -> HcloudResult<()> {
        self.delete(&format!("certificates/{}", cert_id)).await
    }

    // ---- images ----

    /// List snapshots matching a label selector
    pub async fn list_snapshots_by_selector(&self, selector: &str) -> HcloudResult<Vec<Image>> {
        let response: ImageListResponse = self
            .get(&format!(
                "images?type=snapshot&label_selector={}",
                urlencode(selector)
            ))
            .await?;
        Ok(response.images)
    }

    /// Delete an image
    pub async fn delete_image(&self, image_id: i64) -> HcloudResult<()> {
        self.delete(&format!("images/{}", image_id)).await
    }

    // ---- ssh keys ----

    /// Get an SSH key by its exact name
    pub async fn get_ssh_key_by_name(&self, name: &str) -> HcloudResult<Option<SshKey>> {
        let response: SshKeyListResponse = self.get(&format!("ssh_keys?name={}", name)).await?;
        Ok(response.ssh_keys.into_iter().find(|k| k.name == name))
    }

    /// List SSH keys matching a label selector
    pub async fn list_ssh_keys_by_selector(&self, selector: &str) -> HcloudResult<Vec<SshKey>> {
        let response: SshKeyListResponse = self
            .get(&format!("ssh_keys?label_selector={}", urlencode(selector)))
            .await?;
        Ok(response.ssh_keys)
    }

    /// Upload an SSH public key
    pub async fn create_ssh_key(&self, request: &CreateSshKeyRequest) -> HcloudResult<SshKey> {
        let response: CreateSshKeyResponse = self.post("ssh_keys", request).await?;
        Ok(response.ssh_key)
    }

    /// Delete an SSH key
    pub async fn delete_ssh_key(&self, key_id: i64) -> HcloudResult<()> {
        self.delete(&format!("ssh_keys/{}", key_id)).await
    }
}

/// Percent-encode a label selector for use in a query string
fn urlencode(raw: &str) -> String {
    raw.replace('=', "%3D").replace(',', "%2C")
}

// ---- request / response bodies ----

/// Request structure for creating a server
#[derive(Debug, Serialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub server_type: String,
    pub location: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_keys: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networks: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_net: Option<Vec<PrivateNetRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement_group: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    pub public_net: PublicNetRequest,
    pub start_after_create: bool,
}

#[derive(Debug, Serialize)]
pub struct PrivateNetRequest {
    pub network: i64,
    pub ip: String,
}

#[derive(Debug, Serialize)]
pub struct PublicNetRequest {
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
}

/// Request structure for creating a network
#[derive(Debug, Serialize)]
pub struct CreateNetworkRequest {
    pub name: String,
    pub ip_range: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnets: Option<Vec<SubnetRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Request structure for creating a subnet
#[derive(Debug, Serialize)]
pub struct SubnetRequest {
    pub ip_range: String,
    pub network_zone: String,
    #[serde(rename = "type")]
    pub subnet_type: String,
}

/// Request structure for creating a firewall
#[derive(Debug, Serialize)]
pub struct CreateFirewallRequest {
    pub name: String,
    pub rules: Vec<FirewallRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply_to: Option<Vec<FirewallResourceRef>>,
}

#[derive(Debug, Serialize)]
pub struct FirewallResourceRef {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

#[derive(Debug, Serialize)]
struct ApplyToResourcesRequest {
    apply_to: Vec<FirewallResourceRef>,
}

/// Request structure for creating a load balancer
#[derive(Debug, Serialize)]
pub struct CreateLoadBalancerRequest {
    pub name: String,
    pub load_balancer_type: String,
    pub location: String,
    pub algorithm: LoadBalancerAlgorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize)]
pub struct LoadBalancerAlgorithm {
    #[serde(rename = "type")]
    pub algorithm_type: String,
}

/// Request structure for creating a placement group
#[derive(Debug, Serialize)]
pub struct CreatePlacementGroupRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Request structure for uploading a certificate
#[derive(Debug, Serialize)]
pub struct CreateCertificateRequest {
    pub name: String,
    pub certificate: String,
    pub private_key: String,
    #[serde(rename = "type")]
    pub cert_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Request structure for uploading an SSH key
#[derive(Debug, Serialize)]
pub struct CreateSshKeyRequest {
    pub name: String,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize)]
struct ChangeDnsPtrRequest {
    ip: String,
    dns_ptr: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateServerResponse {
    pub server: Server,
    pub action: Action,
}

#[derive(Debug, Deserialize)]
struct CreateNetworkResponse {
    network: Network,
}

#[derive(Debug, Deserialize)]
struct CreateFirewallResponse {
    firewall: Firewall,
}

#[derive(Debug, Deserialize)]
struct CreateLoadBalancerResponse {
    load_balancer: LoadBalancer,
}

#[derive(Debug, Deserialize)]
struct CreatePlacementGroupResponse {
    placement_group: PlacementGroup,
}

#[derive(Debug, Deserialize)]
struct CreateCertificateResponse {
    certificate: Certificate,
}

#[derive(Debug, Deserialize)]
struct CreateSshKeyResponse {
    ssh_key: SshKey,
}

#[derive(Debug, Deserialize)]
struct ServerListResponse {
    servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
struct NetworkListResponse {
    networks: Vec<Network>,
}

#[derive(Debug, Deserialize)]
struct FirewallListResponse {
    firewalls: Vec<Firewall>,
}

#[derive(Debug, Deserialize)]
struct LoadBalancerListResponse {
    load_balancers: Vec<LoadBalancer>,
}

#[derive(Debug, Deserialize)]
struct PlacementGroupListResponse {
    placement_groups: Vec<PlacementGroup>,
}

#[derive(Debug, Deserialize)]
struct CertificateListResponse {
    certificates: Vec<Certificate>,
}

#[derive(Debug, Deserialize)]
struct ImageListResponse {
    images: Vec<Image>,
}

#[derive(Debug, Deserialize)]
struct SshKeyListResponse {
    ssh_keys: Vec<SshKey>,
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    action: Action,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct ActionsResponse {
    actions: Vec<Action>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let result = HetznerCloudClient::new("test-token".to_string());
        assert!(result.is_ok());
    }

    #[test]
    fn test_client_rejects_unprintable_token() {
        let result = HetznerCloudClient::new("bad\ntoken".to_string());
        assert!(matches!(result, Err(HcloudError::InvalidToken)));
    }

    #[test]
    fn test_urlencode_selector() {
        assert_eq!(urlencode("cluster=c1,role=cp"), "cluster%3Dc1%2Crole%3Dcp");
    }

    #[test]
    fn test_resource_in_use_classification() {
        let in_use = HcloudError::Api {
            method: Method::DELETE,
            endpoint: "firewalls/1".to_string(),
            code: "resource_in_use".to_string(),
            message: "firewall is still applied".to_string(),
        };
        assert!(in_use.is_resource_in_use());

        let other = HcloudError::Api {
            method: Method::GET,
            endpoint: "servers".to_string(),
            code: "rate_limit_exceeded".to_string(),
            message: "slow down".to_string(),
        };
        assert!(!other.is_resource_in_use());
    }

    #[test]
    fn test_create_server_request_skips_empty_fields() {
        let request = CreateServerRequest {
            name: "c1-cp-1".to_string(),
            server_type: "cpx21".to_string(),
            location: "nbg1".to_string(),
            image: "123".to_string(),
            ssh_keys: None,
            user_data: None,
            networks: None,
            private_net: None,
            placement_group: None,
            labels: None,
            public_net: PublicNetRequest {
                enable_ipv4: true,
                enable_ipv6: true,
            },
            start_after_create: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("ssh_keys").is_none());
        assert!(json.get("placement_group").is_none());
        assert_eq!(json["public_net"]["enable_ipv4"], true);
    }
}
