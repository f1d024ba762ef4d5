//! Burrow Tunnel Protocol
//!
//! Every tunnel stream opens with one length-prefixed `bincode` frame from
//! the visitor ([`TunnelRequest`]) and one answer from the proxy side
//! ([`TunnelResponse`]). Once accepted, the stream carries raw bytes.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BurrowError, Result};

/// Largest header frame accepted from a peer
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Tunnel Messages
// ─────────────────────────────────────────────────────────────────────────────

/// Sent by a visitor on a fresh tunnel stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    /// Proxy the visitor wants to reach
    pub proxy_name: String,

    /// Shared secret of the proxy (stcp/xtcp)
    pub secret_key: String,

    /// Address of the user connected to the visitor
    pub src_addr: Option<SocketAddr>,

    /// Local address the user connected to
    pub dst_addr: Option<SocketAddr>,
}

impl TunnelRequest {
    pub fn new(proxy_name: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            proxy_name: proxy_name.into(),
            secret_key: secret_key.into(),
            src_addr: None,
            dst_addr: None,
        }
    }

    pub fn with_addrs(mut self, src_addr: Option<SocketAddr>, dst_addr: Option<SocketAddr>) -> Self {
        self.src_addr = src_addr;
        self.dst_addr = dst_addr;
        self
    }
}

/// Answer of the proxy side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelResponse {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl TunnelResponse {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }

    /// Turn a rejection into an error
    pub fn into_result(self) -> Result<()> {
        if self.accepted {
            Ok(())
        } else {
            Err(BurrowError::Rejected(
                self.reason.unwrap_or_else(|| "no reason given".to_string()),
            ))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Framing
// ─────────────────────────────────────────────────────────────────────────────

/// Send a serializable message with length prefix
pub async fn write_frame<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let bytes = bincode::serialize(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(BurrowError::StreamError(format!(
            "Frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    let len = bytes.len() as u32;

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| BurrowError::StreamError(format!("Failed to write length: {}", e)))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| BurrowError::StreamError(format!("Failed to write frame: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| BurrowError::StreamError(format!("Failed to flush frame: {}", e)))?;

    Ok(())
}

/// Receive a deserializable message with length prefix
pub async fn read_frame<T, R>(reader: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| BurrowError::StreamError(format!("Failed to read length: {}", e)))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(BurrowError::StreamError(format!(
            "Frame of {} bytes exceeds limit",
            len
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| BurrowError::StreamError(format!("Failed to read frame: {}", e)))?;

    bincode::deserialize(&buf)
        .map_err(|e| BurrowError::Serialization(format!("Failed to deserialize: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = TunnelRequest::new("web", "s3cret")
            .with_addrs(Some("203.0.113.9:50000".parse().unwrap()), None);

        write_frame(&mut client, &request).await.unwrap();
        let received: TunnelRequest = read_frame(&mut server).await.unwrap();

        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        client.write_all(&len).await.unwrap();

        let result: Result<TunnelResponse> = read_frame(&mut server).await;
        assert!(matches!(result, Err(BurrowError::StreamError(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let result: Result<TunnelResponse> = read_frame(&mut server).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_rejection_into_error() {
        assert!(TunnelResponse::accepted().into_result().is_ok());

        let err = TunnelResponse::rejected("bad secret").into_result().unwrap_err();
        assert!(matches!(err, BurrowError::Rejected(ref r) if r == "bad secret"));
    }
}
