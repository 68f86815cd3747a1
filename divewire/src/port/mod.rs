//! Port abstraction for serial communication with dive computers.
//!
//! The protocol code is written against the [`Port`] trait, so the byte
//! transport is swappable:
//!
//! - **Native platforms** (Linux, macOS, Windows): the `serialport` crate
//!   via [`NativePort`]
//! - **Tests**: a scripted in-memory port
//!
//! A port is a plain byte pipe: it carries no framing of its own. Framing,
//! echo verification and checksums live in the per-family device modules.

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout. `None` blocks until all requested bytes arrive.
    pub timeout: Option<Duration>,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 9600,
            timeout: Some(Duration::from_millis(1000)),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// Which buffer queue to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    /// Received but unread bytes.
    Input,
    /// Written but untransmitted bytes.
    Output,
    /// Both queues.
    Both,
}

/// Modem status lines readable through [`Port::read_line`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    /// Data carrier detect.
    Dcd,
    /// Clear to send.
    Cts,
    /// Data set ready.
    Dsr,
    /// Ring indicator.
    Rng,
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Unified port trait for serial communication.
pub trait Port: Read + Write + Send {
    /// Reconfigure baud rate, character format and flow control.
    fn configure(
        &mut self,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
        flow_control: FlowControl,
    ) -> Result<()>;

    /// Set the read timeout. `None` blocks until the requested bytes arrive,
    /// a zero duration returns immediately with whatever is buffered.
    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard buffered bytes in the given queue.
    fn flush_queue(&mut self, queue: Queue) -> Result<()>;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Read a modem status line.
    fn read_line(&mut self, line: Line) -> Result<bool>;

    /// Number of received bytes waiting to be read.
    fn bytes_available(&mut self) -> Result<usize>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    fn close(&mut self) -> Result<()>;

    /// Suspend the calling thread. Lives on the port so scripted test ports
    /// can skip the delay.
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Write all bytes and flush, mapping failures to [`Error::Io`].
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }

    /// Read exactly `buf.len()` bytes. A short read within the deadline
    /// surfaces as [`Error::Timeout`].
    fn read_all_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut nbytes = 0;
        while nbytes < buf.len() {
            match self.read(&mut buf[nbytes..]) {
                Ok(0) => {
                    return Err(Error::Timeout(format!(
                        "short read: {nbytes} of {} bytes",
                        buf.len()
                    )));
                },
                Ok(n) => nbytes += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(Error::Timeout(format!(
                        "short read: {nbytes} of {} bytes",
                        buf.len()
                    )));
                },
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }
}

/// Trait for listing available serial ports.
///
/// Separated from `Port` because enumeration is a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;

    /// Find ports matching the given VID/PID.
    fn find_by_vid_pid(vid: u16, pid: u16) -> Result<Vec<PortInfo>> {
        let ports = Self::list_ports()?;
        Ok(ports
            .into_iter()
            .filter(|p| p.vid == Some(vid) && p.pid == Some(pid))
            .collect())
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
