//! Serial port communication implementation
//!
//! Provides serial port discovery and the serial transport for direct
//! hardware connection to CNC controllers via USB or RS-232.
//!
//! The `serialport` crate is blocking, so reads happen on a dedicated thread
//! with a short timeout and reach the async side through a channel; writes
//! run on the blocking pool.

use crate::communication::{ByteSink, ByteSource, ConnectionParams, SerialParity, TransportHalves};
use async_trait::async_trait;
use gcodestream_core::{ConnectionError, Error, Result};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Read timeout of the reader thread; bounds how long it takes to notice a close
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }

    /// Set manufacturer
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set serial number
    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }
}

impl std::fmt::Display for SerialPortInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.port_name, self.description)?;
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            write!(f, " [{:04x}:{:04x}]", vid, pid)?;
        }
        Ok(())
    }
}

/// List serial ports that look like CNC controllers
///
/// Only these name patterns are returned:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        ConnectionError::SerialError {
            reason: format!("Failed to enumerate ports: {}", e),
        }
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_valid_cnc_port(&port.port_name))
        .map(|port| {
            let info = SerialPortInfo::new(&port.port_name, get_port_description(port));
            match &port.port_type {
                serialport::SerialPortType::UsbPort(usb_info) => {
                    let mut info = info.with_usb_ids(usb_info.vid, usb_info.pid);
                    if let Some(ref mfg) = usb_info.manufacturer {
                        info = info.with_manufacturer(mfg);
                    }
                    if let Some(ref serial) = usb_info.serial_number {
                        info = info.with_serial_number(serial);
                    }
                    info
                }
                _ => info,
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

fn to_serialport_parity(parity: SerialParity) -> serialport::Parity {
    match parity {
        SerialParity::None => serialport::Parity::None,
        SerialParity::Even => serialport::Parity::Even,
        SerialParity::Odd => serialport::Parity::Odd,
    }
}

fn invalid(reason: String) -> Error {
    ConnectionError::InvalidParameters { reason }.into()
}

/// Open the serial port named in `params`
pub fn open(params: &ConnectionParams) -> Result<TransportHalves> {
    let data_bits = match params.data_bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        8 => serialport::DataBits::Eight,
        other => return Err(invalid(format!("Invalid data bits: {}", other))),
    };
    let stop_bits = match params.stop_bits {
        1 => serialport::StopBits::One,
        2 => serialport::StopBits::Two,
        other => return Err(invalid(format!("Invalid stop bits: {}", other))),
    };

    let port = serialport::new(&params.port, params.baud_rate)
        .timeout(READ_TIMEOUT)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(to_serialport_parity(params.parity))
        .flow_control(if params.flow_control {
            serialport::FlowControl::Hardware
        } else {
            serialport::FlowControl::None
        })
        .open()
        .map_err(|e| {
            tracing::warn!("Failed to open serial port {}: {}", params.port, e);
            match e.kind() {
                serialport::ErrorKind::NoDevice => ConnectionError::PortNotFound {
                    port: params.port.clone(),
                },
                _ => ConnectionError::FailedToOpen {
                    port: params.port.clone(),
                    reason: e.to_string(),
                },
            }
        })?;

    let reader = port.try_clone().map_err(|e| ConnectionError::SerialError {
        reason: format!("Failed to clone port handle: {}", e),
    })?;

    Ok(TransportHalves {
        source: Box::new(SerialSource::spawn(reader, params.port.clone())),
        sink: Box::new(SerialSink {
            port: Arc::new(Mutex::new(port)),
        }),
        address: params.address(),
    })
}

/// Incoming half; bytes arrive from the reader thread
struct SerialSource {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    stop: Arc<AtomicBool>,
}

impl SerialSource {
    fn spawn(mut port: Box<dyn serialport::SerialPort>, name: String) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        std::thread::spawn(move || {
            let mut buf = [0u8; 1024];
            while !thread_stop.load(Ordering::Relaxed) {
                match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
            tracing::debug!("Serial reader for {} stopped", name);
        });

        Self { rx, stop }
    }
}

impl Drop for SerialSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl ByteSource for SerialSource {
    async fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.rx.recv().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Outgoing half
struct SerialSink {
    port: Arc<Mutex<Box<dyn serialport::SerialPort>>>,
}

#[async_trait]
impl ByteSink for SerialSink {
    async fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        let port = self.port.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut port = port.lock();
            let mut written = 0;
            while written < data.len() {
                match port.write(&data[written..]) {
                    Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "port closed")),
                    Ok(n) => written += n,
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(e),
                }
            }
            port.flush()
        })
        .await
        .map_err(io::Error::other)?
    }
}
