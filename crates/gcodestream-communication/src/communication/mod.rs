//! Communication layer
//!
//! A transport (serial, TCP, WebSocket or the in-memory [`VirtualPort`]) is
//! opened into a pair of byte halves. The [`Communicator`] drives those halves
//! from two tasks: the reader task frames incoming bytes into lines and hands
//! them on in arrival order, the writer task writes command lines and realtime
//! bytes in the order they were queued.
//!
//! [`VirtualPort`]: virtual_port::VirtualPort

pub mod buffered;
pub mod serial;
pub mod tcp;
pub mod virtual_port;
pub mod websocket;

use async_trait::async_trait;
use gcodestream_core::{ConnectionError, ControllerError, Result};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Longest line accepted from the firmware before it is force-split
const MAX_LINE_LENGTH: usize = 4096;

/// Size of a single transport read
const READ_CHUNK_SIZE: usize = 1024;

/// Connection driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionDriver {
    /// Serial/USB connection
    #[default]
    Serial,
    /// TCP/IP network connection
    Tcp,
    /// WebSocket connection
    WebSocket,
}

impl std::fmt::Display for ConnectionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial => write!(f, "serial"),
            Self::Tcp => write!(f, "tcp"),
            Self::WebSocket => write!(f, "websocket"),
        }
    }
}

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Connection parameters for a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Connection driver type
    pub driver: ConnectionDriver,
    /// Serial port name, host name, or WebSocket URL
    pub port: String,
    /// TCP port (TCP driver only)
    pub network_port: u16,
    /// Baud rate (serial only)
    pub baud_rate: u32,
    /// Data bits (serial only)
    pub data_bits: u8,
    /// Stop bits (serial only)
    pub stop_bits: u8,
    /// Parity (serial only)
    pub parity: SerialParity,
    /// Hardware flow control (serial only)
    pub flow_control: bool,
    /// Connect timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            driver: ConnectionDriver::Serial,
            port: String::new(),
            network_port: 23,
            baud_rate: 115200,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: false,
            timeout_ms: 5000,
        }
    }
}

impl ConnectionParams {
    /// Serial connection on `port`
    pub fn serial(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// TCP connection to `host:network_port`
    pub fn tcp(host: impl Into<String>, network_port: u16) -> Self {
        Self {
            driver: ConnectionDriver::Tcp,
            port: host.into(),
            network_port,
            ..Default::default()
        }
    }

    /// WebSocket connection to `url`
    pub fn websocket(url: impl Into<String>) -> Self {
        Self {
            driver: ConnectionDriver::WebSocket,
            port: url.into(),
            ..Default::default()
        }
    }

    /// Builder method to set the connect timeout
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Human readable address of the endpoint
    pub fn address(&self) -> String {
        match self.driver {
            ConnectionDriver::Serial => format!("{}@{}", self.port, self.baud_rate),
            ConnectionDriver::Tcp => format!("{}:{}", self.port, self.network_port),
            ConnectionDriver::WebSocket => self.port.clone(),
        }
    }

    /// Check the parameters before opening anything
    pub fn validate(&self) -> std::result::Result<(), ConnectionError> {
        let invalid = |reason: &str| {
            Err(ConnectionError::InvalidParameters {
                reason: reason.to_string(),
            })
        };
        if self.port.trim().is_empty() {
            return invalid("no port, host or URL given");
        }
        if self.timeout_ms == 0 {
            return invalid("connect timeout must be greater than zero");
        }
        match self.driver {
            ConnectionDriver::Serial if self.baud_rate == 0 => {
                invalid("baud rate must be greater than zero")
            }
            ConnectionDriver::Tcp if self.network_port == 0 => invalid("TCP port must be set"),
            ConnectionDriver::WebSocket
                if !(self.port.starts_with("ws://") || self.port.starts_with("wss://")) =>
            {
                invalid("WebSocket URL must start with ws:// or wss://")
            }
            _ => Ok(()),
        }
    }
}

/// Receiving half of a transport
#[async_trait]
pub trait ByteSource: Send {
    /// Next chunk of bytes; `None` once the peer closed the link
    async fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Sending half of a transport
#[async_trait]
pub trait ByteSink: Send {
    /// Write all of `data`
    async fn write_bytes(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush and close the link
    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An opened transport, split into its two directions
pub struct TransportHalves {
    /// Incoming bytes
    pub source: Box<dyn ByteSource>,
    /// Outgoing bytes
    pub sink: Box<dyn ByteSink>,
    /// Where the link goes, for logs and events
    pub address: String,
}

/// Open the transport described by `params`
pub async fn open_transport(params: &ConnectionParams) -> Result<TransportHalves> {
    params.validate()?;
    let timeout = Duration::from_millis(params.timeout_ms);
    tracing::info!("Opening {} connection to {}", params.driver, params.address());
    match params.driver {
        ConnectionDriver::Serial => serial::open(params),
        ConnectionDriver::Tcp => tcp::open(params, timeout).await,
        ConnectionDriver::WebSocket => websocket::open(params, timeout).await,
    }
}

/// [`ByteSource`] over any tokio reader
pub(crate) struct AsyncReadSource<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R> AsyncReadSource<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0; READ_CHUNK_SIZE],
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ByteSource for AsyncReadSource<R> {
    async fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        let n = self.inner.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf[..n].to_vec()))
    }
}

/// [`ByteSink`] over any tokio writer
pub(crate) struct AsyncWriteSink<W> {
    inner: W,
}

impl<W> AsyncWriteSink<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ByteSink for AsyncWriteSink<W> {
    async fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Splits an unframed byte stream into trimmed, non-empty lines.
///
/// Both `\n` and `\r` terminate a line. Bytes that are not valid UTF-8 are
/// replaced rather than dropping the line.
#[derive(Debug, Default)]
pub struct LineFramer {
    partial: Vec<u8>,
}

impl LineFramer {
    /// Create an empty framer
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every line they complete
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            match byte {
                b'\n' | b'\r' => self.flush_into(&mut lines),
                _ => {
                    self.partial.push(byte);
                    if self.partial.len() >= MAX_LINE_LENGTH {
                        tracing::warn!("Line exceeded {} bytes, splitting", MAX_LINE_LENGTH);
                        self.flush_into(&mut lines);
                    }
                }
            }
        }
        lines
    }

    /// Bytes received since the last line terminator
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        if self.partial.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.partial).trim().to_string();
        self.partial.clear();
        if !line.is_empty() {
            lines.push(line);
        }
    }
}

/// Something the communicator observed on the link
#[derive(Debug, Clone, PartialEq)]
pub enum CommunicatorEvent {
    /// One framed response line
    Line(String),
    /// The link failed or the peer closed it
    Disconnected(Option<String>),
}

/// Outgoing traffic, kept in one channel so lines and realtime bytes leave in
/// the order they were queued
#[derive(Debug)]
enum Outgoing {
    Line(String),
    Byte(u8),
}

/// Owns an open transport through its reader and writer tasks
pub struct Communicator {
    address: String,
    tx: mpsc::UnboundedSender<Outgoing>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Communicator {
    /// Start the reader and writer tasks over `halves`.
    ///
    /// Every framed line and the first link failure are delivered to `events`.
    pub fn start(
        halves: TransportHalves,
        events: mpsc::UnboundedSender<CommunicatorEvent>,
    ) -> Self {
        let TransportHalves {
            mut source,
            mut sink,
            address,
        } = halves;
        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        let connected = Arc::new(AtomicBool::new(true));

        let reader_events = events.clone();
        let reader_connected = connected.clone();
        let reader = tokio::spawn(async move {
            let mut framer = LineFramer::new();
            let reason = loop {
                match source.read_chunk().await {
                    Ok(Some(chunk)) => {
                        for line in framer.push(&chunk) {
                            tracing::debug!("<< {}", line);
                            if reader_events.send(CommunicatorEvent::Line(line)).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => break "Connection closed by peer".to_string(),
                    Err(e) => break format!("Read failed: {}", e),
                }
            };
            if reader_connected.swap(false, Ordering::SeqCst) {
                tracing::error!("{}", reason);
                let _ = reader_events.send(CommunicatorEvent::Disconnected(Some(reason)));
            }
        });

        let writer_connected = connected.clone();
        let writer = tokio::spawn(async move {
            while let Some(outgoing) = rx.recv().await {
                let result = match &outgoing {
                    Outgoing::Line(text) => {
                        tracing::debug!(">> {}", text);
                        let mut bytes = Vec::with_capacity(text.len() + 1);
                        bytes.extend_from_slice(text.as_bytes());
                        bytes.push(b'\n');
                        sink.write_bytes(&bytes).await
                    }
                    Outgoing::Byte(byte) => {
                        tracing::trace!(">> 0x{:02X}", byte);
                        sink.write_bytes(&[*byte]).await
                    }
                };
                if let Err(e) = result {
                    if writer_connected.swap(false, Ordering::SeqCst) {
                        let reason = format!("Write failed: {}", e);
                        tracing::error!("{}", reason);
                        let _ = events.send(CommunicatorEvent::Disconnected(Some(reason)));
                    }
                    return;
                }
            }
            if let Err(e) = sink.close().await {
                tracing::debug!("Error closing transport: {}", e);
            }
        });

        Self {
            address,
            tx,
            connected,
            reader,
            writer,
        }
    }

    /// Where the link goes
    pub fn address(&self) -> &str {
        &self.address
    }

    /// False once the link failed or was closed
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queue one command line; the terminator is added here
    pub fn write_line(&self, text: &str) -> Result<()> {
        self.queue(Outgoing::Line(text.to_string()))
    }

    /// Queue a realtime byte, outside line framing
    pub fn send_byte_immediately(&self, byte: u8) -> Result<()> {
        self.queue(Outgoing::Byte(byte))
    }

    fn queue(&self, outgoing: Outgoing) -> Result<()> {
        if !self.is_connected() {
            return Err(ControllerError::NotConnected.into());
        }
        self.tx
            .send(outgoing)
            .map_err(|_| ControllerError::NotConnected.into())
    }

    /// Flush queued output and close the link.
    ///
    /// No disconnect event is produced for a close requested here.
    pub async fn close(self) {
        self.connected.store(false, Ordering::SeqCst);
        self.reader.abort();
        drop(self.tx);
        if let Err(e) = self.writer.await {
            tracing::debug!("Writer task ended abnormally: {}", e);
        }
    }
}
