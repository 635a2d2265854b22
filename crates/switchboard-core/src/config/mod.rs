//! Proxy configuration
//!
//! - `proxy_config`: configuration structure
//! - `defaults`: default configuration values

pub mod defaults;
pub mod proxy_config;

pub use proxy_config::ProxyConfig;
