/// Basalt - Talos Kubernetes on Hetzner Cloud
///
/// A stateless, declarative provisioner: desired state is a YAML
/// document, actual state lives entirely in cloud resource labels and a
/// cluster-side marker. Each invocation is a one-shot `apply` or
/// `destroy`.
pub mod config;
pub mod hcloud;
pub mod net;
pub mod phases;
pub mod pipeline;
pub mod rdns;
pub mod talos;
pub mod utils;
