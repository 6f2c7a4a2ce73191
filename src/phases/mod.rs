/// Provisioning phases, in pipeline order
pub mod validate;
pub mod infra;
pub mod compute;
pub mod bootstrap;
pub mod destroy;
