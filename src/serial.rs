//! Serial port collaborator.
//!
//! [`SerialPorts`] lists and opens ports by name. [`SystemSerialPorts`]
//! implements it with `tokio-serial`; tests substitute in-memory pipes.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::Result;

/// Baud rate of the flight controller's USB VCP.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Enumerate and open serial ports.
pub trait SerialPorts {
    /// Stream type returned by [`open`](Self::open).
    type Port: AsyncRead + AsyncWrite + Unpin;

    /// Names of the ports currently present.
    fn available(&self) -> Result<Vec<String>>;

    /// Open `name` at `baud_rate`, 8N1, no flow control.
    fn open(&self, name: &str, baud_rate: u32) -> Result<Self::Port>;

    /// Whether `name` is currently present.
    fn is_present(&self, name: &str) -> Result<bool> {
        Ok(self.available()?.iter().any(|p| p == name))
    }
}

/// Ports of the host system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSerialPorts;

impl SerialPorts for SystemSerialPorts {
    type Port = SerialStream;

    fn available(&self) -> Result<Vec<String>> {
        let ports = tokio_serial::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    // Must be called from within a tokio runtime.
    fn open(&self, name: &str, baud_rate: u32) -> Result<SerialStream> {
        let port = tokio_serial::new(name, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;
        tracing::debug!(port = name, baud_rate, "serial port opened");
        Ok(port)
    }
}
