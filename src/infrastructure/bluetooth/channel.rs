//! Byte Channel
//!
//! Blocking, ordered, bidirectional byte stream to the rig. The serial
//! implementation talks to the device node an RFCOMM binding exposes.

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::debug;

/// Contract the link needs from the transport.
pub trait ByteChannel: Send {
    /// Write every byte of `bytes` or fail.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Fill `buf` completely or fail.
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

/// RFCOMM channel exposed as a serial port.
pub struct SerialChannel {
    port: Option<Box<dyn SerialPort>>,
    name: String,
}

impl SerialChannel {
    pub fn open(path: &str, baud: u32, timeout: Duration) -> io::Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("open {}: {}", path, e)))?;

        debug!("Opened serial channel {} at {} baud", path, baud);
        Ok(Self {
            port: Some(port),
            name: path.to_string(),
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel closed"))
    }
}

impl ByteChannel for SerialChannel {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        Write::write_all(port, bytes)?;
        port.flush()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        Read::read_exact(self.port()?, buf)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            debug!("Closed serial channel {}", self.name);
        }
        Ok(())
    }
}
