pub mod config;
pub mod state;

pub use config::{ExecutionConfig, GatewayConfig, HealthConfig, LoggingConfig, PricingConfig, RoutingConfig};
pub use state::AppState;
