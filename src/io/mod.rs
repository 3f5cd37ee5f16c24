//! I/O utilities for tun-bridge
//!
//! # UDP Buffer Pool
//!
//! The `UdpBufferPool` provides lock-free buffer reuse for the UDP datagram
//! loop and the DNS relay.

mod buffer_pool;

pub use buffer_pool::{
    BufferPoolConfig, BufferPoolStats, BufferPoolStatsSnapshot, PooledBuffer, UdpBufferPool,
    DEFAULT_POOL_CAPACITY, DEFAULT_UDP_BUFFER_SIZE,
};
