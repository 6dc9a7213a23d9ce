pub mod paths;

pub use paths::GatewayPaths;
