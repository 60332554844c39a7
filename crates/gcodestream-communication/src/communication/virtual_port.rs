//! In-memory virtual port
//!
//! A [`VirtualPort`] is a transport whose far end is a [`VirtualFirmware`]
//! handle. Tests (and dry runs) read what the host sent and answer like a
//! controller would, without hardware.

use crate::communication::{AsyncReadSource, AsyncWriteSink, TransportHalves};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

/// Bytes buffered in each direction before writers wait
const LINK_CAPACITY: usize = 64 * 1024;

/// Realtime bytes recognised at the start of a line
const REALTIME_BYTES: &[u8] = b"?!~%\x18";

/// Factory for in-memory links
pub struct VirtualPort;

impl VirtualPort {
    /// Open a link named `name`
    ///
    /// Returns the host side (to hand to a communicator) and the firmware side.
    pub fn open(name: &str) -> (TransportHalves, VirtualFirmware) {
        let (host, firmware) = tokio::io::duplex(LINK_CAPACITY);
        let (host_read, host_write) = tokio::io::split(host);
        let (fw_read, fw_write) = tokio::io::split(firmware);
        (
            TransportHalves {
                source: Box::new(AsyncReadSource::new(host_read)),
                sink: Box::new(AsyncWriteSink::new(host_write)),
                address: format!("virtual:{}", name),
            },
            VirtualFirmware {
                reader: fw_read,
                writer: fw_write,
                partial: Vec::new(),
            },
        )
    }
}

/// What the host wrote, as seen by the firmware end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    /// A newline-terminated command line, terminator removed
    Line(String),
    /// A single realtime byte sent outside line framing
    Realtime(u8),
}

/// Firmware end of a [`VirtualPort`]
pub struct VirtualFirmware {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    partial: Vec<u8>,
}

impl VirtualFirmware {
    /// Next line or realtime byte from the host; `None` once the host closed
    pub async fn next_message(&mut self) -> io::Result<Option<HostMessage>> {
        loop {
            let mut byte = [0u8; 1];
            if self.reader.read(&mut byte).await? == 0 {
                return Ok(None);
            }
            let byte = byte[0];
            if self.partial.is_empty() && (REALTIME_BYTES.contains(&byte) || byte >= 0x80) {
                return Ok(Some(HostMessage::Realtime(byte)));
            }
            match byte {
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.partial).into_owned();
                    self.partial.clear();
                    return Ok(Some(HostMessage::Line(line)));
                }
                b'\r' => {}
                _ => self.partial.push(byte),
            }
        }
    }

    /// Next command line, skipping realtime bytes
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            match self.next_message().await? {
                Some(HostMessage::Line(line)) => return Ok(Some(line)),
                Some(HostMessage::Realtime(_)) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Send one response line; the terminator is added here
    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await
    }

    /// Send raw bytes, e.g. a line split across writes
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// Drop the link, as if the cable was pulled
    pub async fn hang_up(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lines_and_realtime_bytes_are_separated() {
        let (mut host, mut firmware) = VirtualPort::open("test");
        host.sink.write_bytes(b"G0 X1\n").await.unwrap();
        host.sink.write_bytes(b"?").await.unwrap();
        host.sink.write_bytes(b"G1 Y2 F100\r\n").await.unwrap();
        host.sink.write_bytes(&[0x18]).await.unwrap();

        assert_eq!(
            firmware.next_message().await.unwrap(),
            Some(HostMessage::Line("G0 X1".into()))
        );
        assert_eq!(
            firmware.next_message().await.unwrap(),
            Some(HostMessage::Realtime(b'?'))
        );
        assert_eq!(
            firmware.next_message().await.unwrap(),
            Some(HostMessage::Line("G1 Y2 F100".into()))
        );
        assert_eq!(
            firmware.next_message().await.unwrap(),
            Some(HostMessage::Realtime(0x18))
        );
    }

    #[tokio::test]
    async fn test_firmware_replies_reach_host() {
        let (mut host, mut firmware) = VirtualPort::open("test");
        firmware.send_line("ok").await.unwrap();
        assert_eq!(host.source.read_chunk().await.unwrap().unwrap(), b"ok\r\n");
        assert_eq!(host.address, "virtual:test");
    }

    #[tokio::test]
    async fn test_hang_up_ends_host_stream() {
        let (mut host, firmware) = VirtualPort::open("test");
        firmware.hang_up().await;
        assert_eq!(host.source.read_chunk().await.unwrap(), None);
    }
}
