//! TCP and UDP framing for hijacked DNS traffic

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

use super::DnsResolver;
use crate::error::{DnsRelayError, DnsRelayResult};
use crate::stack::StackUdpEndpoint;

/// Relay length-prefixed DNS queries arriving on `stream`.
///
/// Each query is a 2-byte big-endian length followed by that many bytes.
/// Every read and every response write runs under its own `idle_timeout`.
/// The resolver's answer is written back as-is, without a length prefix.
///
/// Returns the number of completed exchanges once the peer closes the stream
/// between queries. Any other failure ends the relay with an error; the caller
/// drops the stream.
pub async fn relay_tcp<S>(
    stream: &mut S,
    resolver: &dyn DnsResolver,
    idle_timeout: Duration,
    buf: &mut [u8],
) -> DnsRelayResult<u64>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut exchanges = 0u64;

    loop {
        let mut len_buf = [0u8; 2];
        match timeout(idle_timeout, stream.read_exact(&mut len_buf)).await {
            Err(_) => return Err(DnsRelayError::Timeout(idle_timeout)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                trace!(exchanges, "TCP DNS peer closed");
                return Ok(exchanges);
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(_)) => {}
        }

        let len = usize::from(u16::from_be_bytes(len_buf));
        if len > buf.len() {
            return Err(DnsRelayError::Oversized {
                len,
                capacity: buf.len(),
            });
        }

        let query = &mut buf[..len];
        timeout(idle_timeout, stream.read_exact(query))
            .await
            .map_err(|_| DnsRelayError::Timeout(idle_timeout))??;

        trace!(len, "TCP DNS query");
        let response = resolver.exchange(query).await?;

        timeout(idle_timeout, async {
            stream.write_all(&response).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| DnsRelayError::Timeout(idle_timeout))??;
        exchanges += 1;
        trace!(len = response.len(), "TCP DNS response");
    }
}

/// Resolve one UDP DNS query and send the answer back to `local`, appearing
/// to come from `remote`.
///
/// Returns the number of bytes written back.
pub async fn relay_udp(
    query: &[u8],
    resolver: &dyn DnsResolver,
    endpoint: &dyn StackUdpEndpoint,
    local: SocketAddr,
    remote: SocketAddr,
) -> DnsRelayResult<usize> {
    trace!(len = query.len(), %local, %remote, "UDP DNS query");

    let response = resolver.exchange(query).await?;
    let written = endpoint.send_to(&response, remote, local).await?;

    debug!(len = written, %local, "UDP DNS response written back");
    Ok(written)
}
