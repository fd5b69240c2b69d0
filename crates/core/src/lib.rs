pub mod config;
pub mod logging;

pub use config::{Config, ModelConfig, OrchestratorConfig};
pub use logging::init_tracing;
