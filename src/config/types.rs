//! Configuration types for tun-bridge
//!
//! Configuration is loaded from JSON files and validated at startup.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::dns::DEFAULT_NAMESERVERS;
use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Virtual interface addressing
    pub tun: TunConfig,

    /// Number of UDP workers
    #[serde(default = "default_udp_workers")]
    pub udp_workers: usize,

    /// Idle timeout of a hijacked TCP DNS connection, in milliseconds
    #[serde(default = "default_dns_relay_timeout_ms")]
    pub dns_relay_timeout_ms: u64,

    /// Capacity of each inbound queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// UDP buffer pool sizing
    #[serde(default)]
    pub buffer_pool: BufferPoolSettings,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Static DNS defaults
    #[serde(default)]
    pub dns_defaults: DnsDefaults,
}

impl BridgeConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tun.validate()?;

        if self.udp_workers == 0 {
            return Err(ConfigError::validation("udp_workers must be at least 1"));
        }

        if self.dns_relay_timeout_ms == 0 {
            return Err(ConfigError::validation("dns_relay_timeout_ms must be positive"));
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::validation("queue_capacity must be at least 1"));
        }

        self.buffer_pool.validate()?;
        if self.buffer_pool.buffer_size < usize::from(self.tun.mtu) {
            return Err(ConfigError::validation(format!(
                "buffer_pool.buffer_size {} is smaller than tun.mtu {}",
                self.buffer_pool.buffer_size, self.tun.mtu
            )));
        }
        self.log.validate()?;
        self.dns_defaults.validate()?;

        Ok(())
    }

    /// DNS relay idle timeout as Duration
    #[must_use]
    pub const fn dns_relay_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_relay_timeout_ms)
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            tun: TunConfig::default(),
            udp_workers: default_udp_workers(),
            dns_relay_timeout_ms: default_dns_relay_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            buffer_pool: BufferPoolSettings::default(),
            log: LogConfig::default(),
            dns_defaults: DnsDefaults::default(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Virtual interface addressing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunConfig {
    /// Device descriptor inherited from the parent process, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fd: Option<i32>,

    /// Address the stack answers as
    pub gateway: String,

    /// Address flows are redirected through
    pub portal: String,

    /// Resolver address whose port-53 traffic is hijacked; `0.0.0.0`
    /// hijacks all DNS
    pub dns: String,

    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl TunConfig {
    /// Validate the addressing
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if an address is not IPv4.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("gateway", &self.gateway),
            ("portal", &self.portal),
            ("dns", &self.dns),
        ] {
            value.trim().parse::<Ipv4Addr>().map_err(|e| {
                ConfigError::validation(format!("tun.{name} '{value}' is not an IPv4 address: {e}"))
            })?;
        }

        if self.mtu < 576 {
            return Err(ConfigError::validation(format!(
                "tun.mtu {} is below the IPv4 minimum of 576",
                self.mtu
            )));
        }

        if let Some(fd) = self.fd {
            if fd < 0 {
                return Err(ConfigError::validation(format!("tun.fd {fd} is negative")));
            }
        }

        Ok(())
    }
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            fd: None,
            gateway: "172.19.0.1".into(),
            portal: "172.19.0.2".into(),
            dns: "172.19.0.2".into(),
            mtu: default_mtu(),
        }
    }
}

/// UDP buffer pool sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferPoolSettings {
    /// Maximum idle buffers retained
    #[serde(default = "default_pool_capacity")]
    pub capacity: usize,

    /// Size of each buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Buffers allocated up front
    #[serde(default)]
    pub prewarm: usize,
}

impl BufferPoolSettings {
    /// Validate the sizing
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if a size is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < 512 || self.buffer_size > 65535 {
            return Err(ConfigError::validation(format!(
                "buffer_pool.buffer_size {} must be within 512..=65535",
                self.buffer_size
            )));
        }
        if self.prewarm > self.capacity {
            return Err(ConfigError::validation(format!(
                "buffer_pool.prewarm {} exceeds capacity {}",
                self.prewarm, self.capacity
            )));
        }
        Ok(())
    }
}

impl Default for BufferPoolSettings {
    fn default() -> Self {
        Self {
            capacity: default_pool_capacity(),
            buffer_size: default_buffer_size(),
            prewarm: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate the format name
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an unknown format.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(ConfigError::validation(format!(
                "log.format '{other}' must be 'json' or 'text'"
            ))),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

/// Static DNS defaults carried for the surrounding proxy core
///
/// Validated here, interpreted elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DnsDefaults {
    /// Default upstream nameservers
    #[serde(default = "default_nameservers")]
    pub nameservers: Vec<String>,

    /// Domains never given a fake IP (glob patterns)
    #[serde(default = "default_fake_ip_filter")]
    pub fake_ip_filter: Vec<String>,

    /// Range fake IPs are allocated from
    #[serde(default = "default_fake_ip_range")]
    pub fake_ip_range: String,
}

impl DnsDefaults {
    /// Validate addresses and patterns
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on an unparsable address,
    /// range or empty pattern.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.nameserver_addrs()?;
        self.fake_ip_net()?;

        if let Some(pos) = self.fake_ip_filter.iter().position(|p| p.trim().is_empty()) {
            return Err(ConfigError::validation(format!(
                "dns_defaults.fake_ip_filter[{pos}] is empty"
            )));
        }

        Ok(())
    }

    /// Parsed nameserver addresses
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on the first unparsable entry.
    pub fn nameserver_addrs(&self) -> Result<Vec<IpAddr>, ConfigError> {
        self.nameservers
            .iter()
            .map(|s| {
                s.trim().parse::<IpAddr>().map_err(|e| {
                    ConfigError::validation(format!("dns_defaults.nameservers '{s}': {e}"))
                })
            })
            .collect()
    }

    /// Parsed fake-IP range
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the range is not an IPv4 CIDR.
    pub fn fake_ip_net(&self) -> Result<Ipv4Net, ConfigError> {
        self.fake_ip_range.trim().parse::<Ipv4Net>().map_err(|e| {
            ConfigError::validation(format!(
                "dns_defaults.fake_ip_range '{}': {e}",
                self.fake_ip_range
            ))
        })
    }
}

impl Default for DnsDefaults {
    fn default() -> Self {
        Self {
            nameservers: default_nameservers(),
            fake_ip_filter: default_fake_ip_filter(),
            fake_ip_range: default_fake_ip_range(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_udp_workers() -> usize {
    crate::bridge::DEFAULT_UDP_WORKERS
}

const fn default_dns_relay_timeout_ms() -> u64 {
    5000
}

const fn default_queue_capacity() -> usize {
    crate::dispatch::DEFAULT_QUEUE_CAPACITY
}

const fn default_pool_capacity() -> usize {
    crate::io::DEFAULT_POOL_CAPACITY
}

const fn default_buffer_size() -> usize {
    crate::io::DEFAULT_UDP_BUFFER_SIZE
}

const fn default_mtu() -> u16 {
    9000
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_nameservers() -> Vec<String> {
    DEFAULT_NAMESERVERS.iter().map(ToString::to_string).collect()
}

fn default_fake_ip_filter() -> Vec<String> {
    [
        "+.stun.*.*",
        "+.stun.*.*.*",
        "+.stun.*.*.*.*",
        "lens.l.google.com",
        "stun.l.google.com",
        "*.n.n.srv.nintendo.net",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_fake_ip_range() -> String {
    "28.0.0.0/8".into()
}
