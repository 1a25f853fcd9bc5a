//! The serial line below the transport, and how to open it.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, SerialPort, StopBits};
use snafu::{ResultExt, Snafu};

use crate::checksum::ChecksumMode;
use crate::frame::Padding;

/// Error type for this module
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Failed to open {path}: {source}"))]
    Open {
        path: String,
        source: serialport::Error,
    },
    #[snafu(display("Unsupported data bits size {bits}"))]
    UnsupportedDataBits { bits: u8 },
    #[snafu(display("Unsupported stop bits {bits}"))]
    UnsupportedStopBits { bits: u8 },
}

/// A byte line the transport can read with a bounded wait.
///
/// Reads may return [`io::ErrorKind::TimedOut`] or [`io::ErrorKind::WouldBlock`]
/// when no data arrived within the read timeout; the transport treats both as
/// "try again until the deadline".
pub trait Link: Read + Write {
    /// Upper bound for the next blocking read.
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Throw away anything received but not yet read.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl Link for Box<dyn SerialPort> {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout)?;
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    None,
    /// RTS/CTS
    Hardware,
}

/// Line settings. Fixed for the life of an open port.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub device: String,
    /// Tried in turn with `device` when the port has to be reopened.
    pub device2: Option<String>,
    pub baud: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub flow: Flow,
    /// Leading sync bytes per transmitted frame.
    pub lead: usize,
    /// Trailing sync bytes per transmitted frame.
    pub trail: usize,
    /// Reply timeout.
    pub timeout_us: u64,
    /// Bus turnaround: minimum time between the last received byte and the next transmission.
    pub delay_us: u64,
    /// Silence that counts as an idle bus.
    pub idle_us: u64,
    /// Check mode used on transmitted frames.
    pub checksum: ChecksumMode,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            device2: None,
            baud: 57600,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: 1,
            flow: Flow::None,
            lead: 0,
            trail: 0,
            timeout_us: 100_000,
            delay_us: 300,
            idle_us: 300,
            checksum: ChecksumMode::Crc16,
        }
    }
}

impl LinkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_micros(self.timeout_us)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_micros(self.delay_us)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_micros(self.idle_us)
    }

    pub fn padding(&self) -> Padding {
        Padding {
            lead: self.lead,
            trail: self.trail,
        }
    }

    /// The configured device paths, primary first.
    pub fn paths(&self) -> impl Iterator<Item = &str> + Clone {
        std::iter::once(self.device.as_str()).chain(self.device2.as_deref())
    }

    fn data_bits(&self) -> Result<DataBits, Error> {
        match self.data_bits {
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            bits => UnsupportedDataBitsSnafu { bits }.fail(),
        }
    }

    fn stop_bits(&self) -> Result<StopBits, Error> {
        match self.stop_bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            bits => UnsupportedStopBitsSnafu { bits }.fail(),
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

impl From<Flow> for FlowControl {
    fn from(flow: Flow) -> Self {
        match flow {
            Flow::None => FlowControl::None,
            Flow::Hardware => FlowControl::Hardware,
        }
    }
}

/// Opens a [`Link`] on one of the configured device paths.
pub trait Connector {
    type Link: Link;

    /// # Errors
    /// Any failure to open or configure the port. The caller owns the retry policy.
    fn connect(&mut self, path: &str, config: &LinkConfig) -> Result<Self::Link, Error>;
}

/// Opens real serial ports through the `serialport` crate.
#[derive(Debug, Default, Copy, Clone)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    type Link = Box<dyn SerialPort>;

    fn connect(&mut self, path: &str, config: &LinkConfig) -> Result<Self::Link, Error> {
        let port = serialport::new(path, config.baud)
            .parity(config.parity.into())
            .data_bits(config.data_bits()?)
            .stop_bits(config.stop_bits()?)
            .flow_control(config.flow.into())
            .timeout(config.timeout())
            .open()
            .context(OpenSnafu { path })?;
        port.clear(ClearBuffer::All).context(OpenSnafu { path })?;
        Ok(port)
    }
}
