//! Newport ESP300 motion controller, one axis.
//!
//! Reference: ESP300 Universal Motion Controller/Driver User's Manual
//!
//! Protocol:
//! - ASCII command/response over RS-232, 19200 baud, 8N1
//! - Commands: `{axis}{command}{value}\r\n`, e.g. `1PA5.000000`
//! - Queries end in `?` and answer with one line
//!
//! | Capability | Command |
//! |---|---|
//! | home | `1OR` |
//! | move | `1PA<pos>` |
//! | position | `1TP?` |
//! | moving | `1MD?` (`0` when stationary) |
//! | units | `1SN?` (`2` mm, `3` um) |
//!
//! The controller has no query for "has been homed", so the driver reports
//! homed only after [`home`](StageDevice::home) succeeded in this session.
//!
//! Replies carry no tag tying them to a query. After a read timeout the port
//! is marked out of sync, and the next query first drains whatever the
//! controller still sends until the line has been quiet for one timeout.

use super::capabilities::{StageDevice, Units};
use crate::error::{DeviceError, DeviceErrorKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

const DEVICE: &str = "esp300";

/// Byte stream the controller is reached over.
pub trait SerialIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialIo for T {}

/// One ESP300 axis.
pub struct Esp300Stage {
    port: Mutex<BufReader<Box<dyn SerialIo>>>,
    axis: u8,
    timeout: Duration,
    homed: AtomicBool,
    desynced: AtomicBool,
}

impl Esp300Stage {
    /// Wrap an already-open stream.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if `axis` is not 1-3.
    pub fn from_stream(stream: Box<dyn SerialIo>, axis: u8) -> Result<Self, DeviceError> {
        if !(1..=3).contains(&axis) {
            return Err(DeviceError::new(
                DEVICE,
                DeviceErrorKind::InvalidParameter,
                format!("axis must be 1-3, got {}", axis),
            ));
        }

        Ok(Self {
            port: Mutex::new(BufReader::new(stream)),
            axis,
            timeout: Duration::from_secs(5),
            homed: AtomicBool::new(false),
            desynced: AtomicBool::new(false),
        })
    }

    /// Open a serial port at 19200 8N1, no flow control.
    #[cfg(feature = "instrument_serial")]
    pub fn open(port_path: &str, axis: u8) -> Result<Self, DeviceError> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(port_path, 19200)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DeviceError::communication(DEVICE, format!("open {}: {}", port_path, e))
            })?;

        tracing::info!(port = port_path, axis, "Opened ESP300");
        Self::from_stream(Box::new(port), axis)
    }

    /// Override the query timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a command and read one response line.
    async fn query(&self, command: &str) -> Result<String, DeviceError> {
        let mut port = self.port.lock().await;
        if self.desynced.load(Ordering::SeqCst) {
            self.discard_stale(&mut port).await?;
            self.desynced.store(false, Ordering::SeqCst);
        }

        let cmd = format!("{}{}\r\n", self.axis, command);
        port.get_mut()
            .write_all(cmd.as_bytes())
            .await
            .map_err(|e| DeviceError::communication(DEVICE, format!("write failed: {}", e)))?;

        let mut response = String::new();
        let read = match tokio::time::timeout(self.timeout, port.read_line(&mut response)).await {
            Ok(read) => read
                .map_err(|e| DeviceError::communication(DEVICE, format!("read failed: {}", e)))?,
            Err(_) => {
                self.desynced.store(true, Ordering::SeqCst);
                return Err(DeviceError::new(
                    DEVICE,
                    DeviceErrorKind::Timeout,
                    format!("no answer to {}{}", self.axis, command),
                ));
            }
        };

        if read == 0 {
            return Err(DeviceError::communication(DEVICE, "port closed"));
        }
        Ok(response.trim().to_string())
    }

    /// Read and drop lines until the port stays quiet for one timeout.
    async fn discard_stale(
        &self,
        port: &mut BufReader<Box<dyn SerialIo>>,
    ) -> Result<(), DeviceError> {
        loop {
            let mut stale = String::new();
            match tokio::time::timeout(self.timeout, port.read_line(&mut stale)).await {
                Err(_) => return Ok(()),
                Ok(Ok(0)) => return Err(DeviceError::communication(DEVICE, "port closed")),
                Ok(Ok(_)) => tracing::warn!(line = stale.trim(), "ESP300: discarding late reply"),
                Ok(Err(e)) => {
                    return Err(DeviceError::communication(
                        DEVICE,
                        format!("read failed: {}", e),
                    ))
                }
            }
        }
    }

    /// Send a command that has no response.
    async fn send_command(&self, command: &str) -> Result<(), DeviceError> {
        let mut port = self.port.lock().await;

        let cmd = format!("{}{}\r\n", self.axis, command);
        let stream = port.get_mut();
        stream
            .write_all(cmd.as_bytes())
            .await
            .map_err(|e| DeviceError::communication(DEVICE, format!("write failed: {}", e)))?;
        stream
            .flush()
            .await
            .map_err(|e| DeviceError::communication(DEVICE, format!("flush failed: {}", e)))?;
        Ok(())
    }

    async fn query_f64(&self, command: &str) -> Result<f64, DeviceError> {
        let response = self.query(command).await?;
        response.parse::<f64>().map_err(|_| {
            DeviceError::new(
                DEVICE,
                DeviceErrorKind::Hardware,
                format!("unexpected answer to {}: {:?}", command, response),
            )
        })
    }
}

#[async_trait]
impl StageDevice for Esp300Stage {
    async fn home(&self) -> Result<(), DeviceError> {
        self.send_command("OR").await?;
        self.homed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn move_to(&self, position: f64) -> Result<(), DeviceError> {
        self.send_command(&format!("PA{:.6}", position)).await
    }

    async fn position(&self) -> Result<f64, DeviceError> {
        self.query_f64("TP?").await
    }

    async fn is_moving(&self) -> Result<bool, DeviceError> {
        let response = self.query("MD?").await?;
        Ok(response != "0")
    }

    async fn is_homed(&self) -> Result<bool, DeviceError> {
        Ok(self.homed.load(Ordering::SeqCst))
    }

    async fn scale_units(&self) -> Result<Units, DeviceError> {
        let code = self.query("SN?").await?;
        Ok(match code.as_str() {
            "2" => Units::Millimeters,
            "3" => Units::Micrometers,
            other => Units::Other(format!("esp300 unit code {}", other)),
        })
    }
}
