//! TCP transport
//!
//! Network-attached controllers (ESP32 boards running FluidNC or grblHAL,
//! serial-to-Ethernet bridges) expose a raw telnet-style socket that speaks
//! exactly the serial protocol.

use crate::communication::{AsyncReadSource, AsyncWriteSink, ConnectionParams, TransportHalves};
use gcodestream_core::{ConnectionError, Result};
use std::time::Duration;
use tokio::net::TcpStream;

/// Connect to `params.port:params.network_port`
pub async fn open(params: &ConnectionParams, timeout: Duration) -> Result<TransportHalves> {
    let address = params.address();
    let stream = tokio::time::timeout(
        timeout,
        TcpStream::connect((params.port.as_str(), params.network_port)),
    )
    .await
    .map_err(|_| ConnectionError::ConnectionTimeout {
        timeout_ms: timeout.as_millis() as u64,
    })?
    .map_err(|e| {
        tracing::warn!("Failed to connect to {}: {}", address, e);
        ConnectionError::FailedToOpen {
            port: address.clone(),
            reason: e.to_string(),
        }
    })?;

    // Command lines are tiny; don't let Nagle hold them back
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Could not set TCP_NODELAY on {}: {}", address, e);
    }

    let (read, write) = stream.into_split();
    Ok(TransportHalves {
        source: Box::new(AsyncReadSource::new(read)),
        sink: Box::new(AsyncWriteSink::new(write)),
        address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcodestream_core::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"ok\n").await.unwrap();
            buf[..n].to_vec()
        });

        let mut halves = open(
            &ConnectionParams::tcp("127.0.0.1", port),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        halves.sink.write_bytes(b"G0 X1\n").await.unwrap();
        assert_eq!(halves.source.read_chunk().await.unwrap().unwrap(), b"ok\n");
        assert_eq!(server.await.unwrap(), b"G0 X1\n");
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = open(
            &ConnectionParams::tcp("127.0.0.1", port),
            Duration::from_secs(2),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
