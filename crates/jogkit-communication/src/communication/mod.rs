//! Transports to the physical controller
//!
//! A `Transport` is a line-oriented duplex link plus a side channel for
//! single real-time bytes. `TransportFactory` opens one for a port. The
//! serial implementation talks to hardware; the mock implementation
//! simulates a GRBL controller for tests and dry runs.

pub mod mock;
pub mod serial;

use async_trait::async_trait;
use jogkit_core::ConnectionError;
use std::io;

pub use mock::{MockDevice, MockTransport, MockTransportFactory, SentFrame};
pub use serial::{list_ports, SerialPortInfo, SerialTransport, SerialTransportFactory};

/// An open link to a controller
///
/// `read_line` must be cancel safe: dropping its future must not lose a
/// line that was already received.
#[async_trait]
pub trait Transport: Send {
    /// Port this transport is connected to
    fn port(&self) -> &str;

    /// Send one command line; the terminator is added by the transport
    async fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Send a single real-time byte
    async fn write_realtime(&mut self, byte: u8) -> io::Result<()>;

    /// Wait for the next complete line from the controller
    async fn read_line(&mut self) -> io::Result<String>;

    /// Close the link
    async fn close(&mut self) -> io::Result<()>;
}

/// Opens transports
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open `port` at `baud_rate`
    async fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn Transport>, ConnectionError>;
}
