/// Hetzner Cloud integration
pub mod client;
pub mod manager;
pub mod models;

pub use client::{HcloudError, HetznerCloudClient};
pub use manager::{CreateServerOpts, HcloudManager, InfrastructureManager};
