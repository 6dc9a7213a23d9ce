pub mod app;
pub mod cli;
pub mod error;
pub mod gateway;
pub mod health;
pub mod platform;
pub mod pricing;
pub mod routing;

pub use error::{Error, Result};
