//! Error types for tun-bridge
//!
//! Errors are grouped by how far they reach:
//!
//! - [`BridgeError`] is fatal to the whole bridge and is only ever returned
//!   from [`Bridge::start`](crate::bridge::Bridge::start).
//! - [`StackError`] comes from the packet stack. [`StackError::Closed`] ends
//!   the loop that saw it; anything else is confined to one flow.
//! - [`DnsRelayError`] ends one DNS relay exchange and nothing else.
//! - [`ConfigError`] is raised while loading or validating configuration.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for tun-bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration errors (address parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The virtual device could not be opened
    #[error("Failed to open virtual device: {0}")]
    Device(#[source] io::Error),

    /// The packet stack could not be started
    #[error("Packet stack error: {0}")]
    Stack(#[from] StackError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// Startup errors are never retried by the bridge itself
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Errors surfaced by the packet stack's listener and endpoint
#[derive(Debug, Error)]
pub enum StackError {
    /// The listener or endpoint was closed; the owning loop must stop
    #[error("Stack closed")]
    Closed,

    /// A single accept failed; the listener is still usable
    #[error("Accept error: {0}")]
    Accept(String),

    /// The stack failed to start
    #[error("Stack startup failed: {0}")]
    Startup(String),

    /// A datagram did not fit the receive buffer and was discarded
    #[error("Datagram of {len} bytes exceeds receive buffer of {capacity}")]
    Oversized { len: usize, capacity: usize },

    /// I/O error on the stack
    #[error("Stack I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StackError {
    /// Whether the loop that observed this error may keep going
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Closed | Self::Startup(_) => false,
            Self::Accept(_) | Self::Oversized { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Whether this error means the listener/endpoint is gone
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Create an accept error
    pub fn accept(reason: impl Into<String>) -> Self {
        Self::Accept(reason.into())
    }

    /// Create an oversize-datagram error
    pub const fn oversized(len: usize, capacity: usize) -> Self {
        Self::Oversized { len, capacity }
    }

    /// Create a startup error
    pub fn startup(reason: impl Into<String>) -> Self {
        Self::Startup(reason.into())
    }
}

/// Errors from a single DNS relay exchange
#[derive(Debug, Error)]
pub enum DnsRelayError {
    /// Read or write on the hijacked flow failed
    #[error("DNS relay I/O error: {0}")]
    Io(#[from] io::Error),

    /// No data arrived within the idle timeout
    #[error("DNS relay idle for {0:?}")]
    Timeout(Duration),

    /// Declared TCP message length does not fit the relay buffer
    #[error("DNS message length {len} exceeds buffer capacity {capacity}")]
    Oversized { len: usize, capacity: usize },

    /// The resolver failed to answer
    #[error("DNS resolve failed: {0}")]
    Resolve(String),

    /// No upstream nameserver is configured
    #[error("No upstream nameserver configured")]
    NoUpstream,

    /// The response could not be written back through the stack
    #[error("DNS response write-back failed: {0}")]
    WriteBack(#[from] StackError),
}

impl DnsRelayError {
    /// Create a resolve error
    pub fn resolve(reason: impl Into<String>) -> Self {
        Self::Resolve(reason.into())
    }

    /// Whether a client retry could succeed
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Resolve(_) | Self::Io(_))
    }
}

/// Result type for DNS relay operations
pub type DnsRelayResult<T> = Result<T, DnsRelayError>;

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Create a validation error
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationError(reason.into())
    }

    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}
