//! Configuration module for tun-bridge
//!
//! # Example
//!
//! ```no_run
//! use tun_bridge::config::load_config;
//!
//! let config = load_config("/etc/tun-bridge/config.json").unwrap();
//! println!("Hijacking DNS to {}", config.tun.dns);
//! ```

mod loader;
mod types;

pub use loader::{
    create_default_config, load_config, load_config_str, load_config_with_env, ENV_DNS,
    ENV_LOG_LEVEL, ENV_UDP_WORKERS,
};
pub use types::{BridgeConfig, BufferPoolSettings, DnsDefaults, LogConfig, TunConfig};
