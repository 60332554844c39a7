//! WebSocket transport
//!
//! Some network controllers expose their console over a WebSocket. Frames do
//! not follow line boundaries, so both text and binary payloads are treated as
//! raw bytes and framed by the communicator like any other stream.

use crate::communication::{ByteSink, ByteSource, ConnectionParams, TransportHalves};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use gcodestream_core::{ConnectionError, Result};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect to the URL in `params.port`
pub async fn open(params: &ConnectionParams, timeout: Duration) -> Result<TransportHalves> {
    let url = params.port.clone();
    let (ws_stream, _response) = tokio::time::timeout(timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| ConnectionError::ConnectionTimeout {
            timeout_ms: timeout.as_millis() as u64,
        })?
        .map_err(|e| {
            tracing::warn!("Failed to connect to {}: {}", url, e);
            ConnectionError::WebSocketError {
                reason: e.to_string(),
            }
        })?;

    let (sink, stream) = ws_stream.split();
    Ok(TransportHalves {
        source: Box::new(WsSource { stream }),
        sink: Box::new(WsSink { sink }),
        address: url,
    })
}

struct WsSource {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl ByteSource for WsSource {
    async fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(Some(text.as_str().as_bytes().to_vec()))
                }
                Some(Ok(WsMessage::Binary(data))) => return Ok(Some(data.to_vec())),
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                // Ping/Pong are answered by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(io::Error::other(e)),
            }
        }
    }
}

struct WsSink {
    sink: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl ByteSink for WsSink {
    async fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        // Realtime bytes above 0x7F are not valid UTF-8 on their own
        let message = match std::str::from_utf8(data) {
            Ok(text) => WsMessage::text(text.to_string()),
            Err(_) => WsMessage::binary(data.to_vec()),
        };
        self.sink.send(message).await.map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        let _ = self.sink.send(WsMessage::Close(None)).await;
        self.sink.close().await.map_err(io::Error::other)
    }
}
