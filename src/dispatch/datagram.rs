//! One captured UDP datagram handed to the dispatch substrate

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::trace;

use crate::error::StackError;
use crate::io::PooledBuffer;
use crate::stack::StackUdpEndpoint;

/// A UDP payload read from the virtual device
///
/// Owns the pooled buffer holding the payload. The buffer goes back to the
/// pool exactly once: through [`Datagram::release`] or when the datagram is
/// dropped. Replies are written with [`Datagram::write_back`] and reach the
/// original sender through the same virtual mapping.
pub struct Datagram {
    buffer: PooledBuffer,
    local: SocketAddr,
    remote: SocketAddr,
    endpoint: Arc<dyn StackUdpEndpoint>,
}

impl Datagram {
    pub(crate) fn new(
        buffer: PooledBuffer,
        local: SocketAddr,
        remote: SocketAddr,
        endpoint: Arc<dyn StackUdpEndpoint>,
    ) -> Self {
        Self {
            buffer,
            local,
            remote,
            endpoint,
        }
    }

    /// Payload bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Virtual-side sender of the datagram
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Destination the sender addressed
    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Send `payload` to the original sender, appearing to come from `from`.
    pub async fn write_back(&self, payload: &[u8], from: SocketAddr) -> Result<usize, StackError> {
        trace!(len = payload.len(), %from, to = %self.local, "UDP write back");
        self.endpoint.send_to(payload, from, self.local).await
    }

    /// Return the buffer to the pool
    pub fn release(self) {
        self.buffer.release();
    }
}

impl fmt::Debug for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datagram")
            .field("len", &self.buffer.len())
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}
