//! Serial port transport
//!
//! Provides port enumeration and a `Transport` over the `serialport`
//! crate. Reads run on a dedicated thread that splits the byte stream
//! into lines and forwards them over a channel; writes run on the
//! blocking pool.

use async_trait::async_trait;
use jogkit_core::ConnectionError;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{Transport, TransportFactory};

const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,
}

/// List serial ports that look like CNC controllers
///
/// - Windows: COM*
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> jogkit_core::Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        io::Error::other(format!("Failed to enumerate ports: {}", e))
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_valid_cnc_port(&port.port_name))
        .map(|port| {
            let manufacturer = match &port.port_type {
                serialport::SerialPortType::UsbPort(usb) => usb.manufacturer.clone(),
                _ => None,
            };
            SerialPortInfo {
                port_name: port.port_name.clone(),
                description: get_port_description(port),
                manufacturer,
            }
        })
        .collect())
}

fn is_valid_cnc_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

fn get_port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            format!(
                "USB {} {}",
                usb_info.manufacturer.as_deref().unwrap_or("Device"),
                usb_info.product.as_deref().unwrap_or("Serial Port")
            )
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Opens `SerialTransport`s
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialTransportFactory;

#[async_trait]
impl TransportFactory for SerialTransportFactory {
    async fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn Transport>, ConnectionError> {
        let name = port.to_string();
        let opened = tokio::task::spawn_blocking(move || SerialTransport::open_blocking(&name, baud_rate))
            .await
            .map_err(|e| ConnectionError::OpenFailed {
                port: port.to_string(),
                reason: e.to_string(),
            })??;
        Ok(Box::new(opened))
    }
}

/// Serial transport
pub struct SerialTransport {
    port_name: String,
    writer: Arc<Mutex<Box<dyn serialport::SerialPort>>>,
    lines: mpsc::UnboundedReceiver<io::Result<String>>,
    shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialTransport {
    fn open_blocking(port: &str, baud_rate: u32) -> Result<Self, ConnectionError> {
        let open_failed = |e: serialport::Error| {
            tracing::warn!("Failed to open serial port {}: {}", port, e);
            ConnectionError::OpenFailed {
                port: port.to_string(),
                reason: e.to_string(),
            }
        };

        let writer = serialport::new(port, baud_rate)
            .timeout(READ_TIMEOUT)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(open_failed)?;
        let reader_port = writer.try_clone().map_err(open_failed)?;

        let (tx, lines) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let reader = std::thread::Builder::new()
            .name(format!("serial-reader-{}", port))
            .spawn(move || read_loop(reader_port, tx, stop))
            .map_err(|e| ConnectionError::OpenFailed {
                port: port.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!("Opened serial port {} at {} baud", port, baud_rate);
        Ok(Self {
            port_name: port.to_string(),
            writer: Arc::new(Mutex::new(writer)),
            lines,
            shutdown,
            reader: Some(reader),
        })
    }
}

async fn write_bytes(
    writer: Arc<Mutex<Box<dyn serialport::SerialPort>>>,
    bytes: Vec<u8>,
) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let mut port = writer.lock();
        port.write_all(&bytes)?;
        port.flush()
    })
    .await
    .map_err(io::Error::other)?
}

fn read_loop(
    mut port: Box<dyn serialport::SerialPort>,
    tx: mpsc::UnboundedSender<io::Result<String>>,
    stop: Arc<AtomicBool>,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 256];

    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(end) = pending.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=end).collect();
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if tx.send(Ok(line)).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!("Serial read failed: {}", e);
                let _ = tx.send(Err(e));
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn port(&self) -> &str {
        &self.port_name
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        write_bytes(self.writer.clone(), bytes).await
    }

    async fn write_realtime(&mut self, byte: u8) -> io::Result<()> {
        write_bytes(self.writer.clone(), vec![byte]).await
    }

    async fn read_line(&mut self) -> io::Result<String> {
        match self.lines.recv().await {
            Some(line) => line,
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "serial reader stopped",
            )),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            tokio::task::spawn_blocking(move || reader.join())
                .await
                .map_err(io::Error::other)?
                .map_err(|_| io::Error::other("serial reader panicked"))?;
        }
        tracing::info!("Closed serial port {}", self.port_name);
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
