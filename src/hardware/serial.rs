//! Serial transport for the controller.
//!
//! The controller is an Arduino-class board on USB serial:
//! - Baud: 115200, 8 data bits, even parity, 1 stop bit, no flow control
//! - Identified by its USB serial number against a configured allow-list
//!
//! # Example
//!
//! ```rust,ignore
//! use graphitizer::hardware::serial::{PortLocator, SerialConnector};
//!
//! let locator = PortLocator::usb_serial(["95635333231351F0E1A1"]);
//! let connector = SerialConnector::new(locator, 115_200);
//! let gate = ChannelGate::open(Arc::new(connector), Duration::from_secs(1)).await?;
//! ```

use crate::error::ChannelError;
use crate::hardware::gate::ChannelConnector;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::spawn_blocking;
use tokio_serial::{SerialPortBuilderExt, SerialPortType};

/// Trait alias for async byte streams usable as the device channel.
///
/// Implemented by `tokio_serial::SerialStream` on hardware and by
/// `tokio::io::DuplexStream` under the simulator.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased device channel.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Default controller baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// How the controller's port path is found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortLocator {
    /// Use this path as-is.
    Fixed(String),
    /// Scan USB serial ports for one whose serial number is allowed.
    UsbSerial {
        /// Accepted serial numbers, whitespace removed.
        allowed: Vec<String>,
        /// Pause between scans.
        interval: Duration,
        /// `None` waits until the device shows up.
        attempts: Option<u32>,
    },
}

impl PortLocator {
    /// Build a USB locator, stripping whitespace from every serial number.
    pub fn usb_serial<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::UsbSerial {
            allowed: normalize_serials(allowed),
            interval: Duration::from_secs(1),
            attempts: None,
        }
    }

    /// Resolve the port path.
    pub async fn locate(&self) -> Result<String, ChannelError> {
        match self {
            PortLocator::Fixed(path) => Ok(path.clone()),
            PortLocator::UsbSerial {
                allowed,
                interval,
                attempts,
            } => {
                let mut tried = 0u32;
                loop {
                    let allowed_owned = allowed.clone();
                    let found = spawn_blocking(move || scan_usb_ports(&allowed_owned))
                        .await
                        .map_err(|e| ChannelError::Acquire(format!("port scan task failed: {e}")))??;
                    if let Some(path) = found {
                        tracing::info!(port = %path, "Controller found");
                        return Ok(path);
                    }

                    tried += 1;
                    if attempts.is_some_and(|max| tried >= max) {
                        return Err(ChannelError::Acquire(format!(
                            "no USB port with an allowed serial number after {tried} scans"
                        )));
                    }
                    tracing::warn!(
                        allowed = allowed.len(),
                        "Controller not found, check if connected"
                    );
                    tokio::time::sleep(*interval).await;
                }
            }
        }
    }
}

/// Remove all whitespace from allow-list entries and drop empty ones.
pub fn normalize_serials<I, S>(allowed: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    allowed
        .into_iter()
        .map(|s| s.as_ref().chars().filter(|c| !c.is_whitespace()).collect::<String>())
        .filter(|s| !s.is_empty())
        .collect()
}

fn scan_usb_ports(allowed: &[String]) -> Result<Option<String>, ChannelError> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| ChannelError::Acquire(format!("failed to enumerate ports: {e}")))?;
    Ok(ports.into_iter().find_map(|port| match port.port_type {
        SerialPortType::UsbPort(info) => info
            .serial_number
            .filter(|sn| allowed.iter().any(|a| a == sn))
            .map(|_| port.port_name),
        _ => None,
    }))
}

/// Open the controller's serial port asynchronously using spawn_blocking.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> Result<tokio_serial::SerialStream, ChannelError> {
    let port_path_owned = port_path.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::Even)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                ChannelError::Acquire(format!(
                    "failed to open serial port {port_path_owned}: {e}"
                ))
            })
    })
    .await
    .map_err(|e| ChannelError::Acquire(format!("spawn_blocking for port opening failed: {e}")))?
}

/// Connects to the controller over a real serial port.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    locator: PortLocator,
    baud_rate: u32,
}

impl SerialConnector {
    /// Connector that finds the port with `locator` on every connect.
    pub fn new(locator: PortLocator, baud_rate: u32) -> Self {
        Self { locator, baud_rate }
    }
}

#[async_trait]
impl ChannelConnector for SerialConnector {
    async fn connect(&self) -> Result<DynSerial, ChannelError> {
        let path = self.locator.locate().await?;
        let port = open_serial_async(&path, self.baud_rate).await?;
        tracing::info!(port = %path, baud = self.baud_rate, "Opened controller serial port");
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        match &self.locator {
            PortLocator::Fixed(path) => format!("serial:{path}"),
            PortLocator::UsbSerial { allowed, .. } => {
                format!("usb-serial:[{}]", allowed.join(","))
            }
        }
    }
}
