//! TCP transport for the laser's remote-control port.
//!
//! Write-only: the laser protocol sends no acknowledgment frames, so nothing
//! is read back and a send succeeds once the bytes are flushed.

use super::capabilities::LaserTransport;
use crate::error::{DeviceError, DeviceErrorKind};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Default write timeout.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Laser socket.
pub struct TcpTransport {
    stream: Mutex<Option<TcpStream>>,
    peer: String,
    write_timeout: Duration,
}

impl TcpTransport {
    /// Connect to `host:port`, giving up after `connect_timeout`.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let peer = format!("{}:{}", host, port);
        let stream = timeout(connect_timeout, TcpStream::connect(&peer))
            .await
            .map_err(|_| {
                DeviceError::new(
                    "laser",
                    DeviceErrorKind::Timeout,
                    format!("connect to {} timed out after {:?}", peer, connect_timeout),
                )
            })?
            .map_err(|e| DeviceError::communication("laser", format!("connect to {}: {}", peer, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| DeviceError::communication("laser", format!("set TCP_NODELAY: {}", e)))?;

        tracing::info!(%peer, "Connected to laser");
        Ok(Self {
            stream: Mutex::new(Some(stream)),
            peer,
            write_timeout: WRITE_TIMEOUT,
        })
    }

    /// Remote address.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl LaserTransport for TcpTransport {
    async fn send(&self, bytes: &[u8]) -> Result<(), DeviceError> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| DeviceError::communication("laser", "connection closed"))?;

        let write = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        };

        match timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DeviceError::communication(
                "laser",
                format!("write to {} failed: {}", self.peer, e),
            )),
            Err(_) => Err(DeviceError::communication(
                "laser",
                format!("write to {} stalled for {:?}", self.peer, self.write_timeout),
            )),
        }
    }

    async fn close(&self) -> Result<(), DeviceError> {
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream
                .shutdown()
                .await
                .map_err(|e| DeviceError::communication("laser", format!("shutdown: {}", e)))?;
            tracing::info!(peer = %self.peer, "Laser connection closed");
        }
        Ok(())
    }
}
