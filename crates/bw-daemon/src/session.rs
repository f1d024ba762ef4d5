//! Tunnel Sessions
//!
//! Byte pumping between a tunnel stream and a local socket, plus the
//! counters shared by all sessions of the daemon.

use bw_core::{BufferPool, Result};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Statistics for tunnel sessions
#[derive(Debug, Default)]
pub struct TunnelStats {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub active_connections: AtomicU64,
    pub total_connections: AtomicU64,
}

impl TunnelStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a session as active until the guard is dropped
    pub fn open(self: &Arc<Self>) -> SessionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TunnelStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_connections: u64,
    pub total_connections: u64,
}

pub struct SessionGuard {
    stats: Arc<TunnelStats>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Copy bytes both ways until both sides are done. `local` is the socket on
/// this machine, `tunnel` the stream to the remote peer. The copy buffer is
/// leased from `pool`, so this waits while the pool is exhausted.
pub async fn pump<L, T>(local: L, tunnel: T, pool: &BufferPool, stats: &Arc<TunnelStats>) -> Result<()>
where
    L: AsyncRead + AsyncWrite,
    T: AsyncRead + AsyncWrite,
{
    let mut lease = pool.acquire().await?;
    let _guard = stats.open();
    let (up, down) = lease.halves();

    let (mut local_rx, mut local_tx) = tokio::io::split(local);
    let (mut tunnel_rx, mut tunnel_tx) = tokio::io::split(tunnel);

    let result = tokio::try_join!(
        copy_half(&mut local_rx, &mut tunnel_tx, up, &stats.bytes_sent),
        copy_half(&mut tunnel_rx, &mut local_tx, down, &stats.bytes_received),
    );
    match result {
        Ok((sent, received)) => {
            debug!("Session closed ({} bytes out, {} bytes in)", sent, received)
        }
        Err(e) => debug!("Session ended: {}", e),
    }
    Ok(())
}

/// One direction of a session; shuts the writer down on EOF
async fn copy_half<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8], counter: &AtomicU64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        total += n as u64;
    }
}
