/// Talos Linux integration
pub mod api;
pub mod producer;

pub use api::{GrpcTalos, TalosApi, TALOS_API_PORT};
pub use producer::{TalosConfigProducer, TalosctlProducer};
