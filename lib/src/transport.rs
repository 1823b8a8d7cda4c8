//! Transport adapter over a WebSocket connection
//!
//! Splits one duplex WebSocket into a receive half and a send half guarded
//! separately, so the inbound pump and the outbound pump never contend.
//! Handshake, authentication and framing stay with tungstenite.

use crate::error::{BridgeError, Result};
use crate::protocol::Message;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// Control frame payloads are limited to 125 bytes, two of which hold the code
const MAX_CLOSE_REASON: usize = 123;

fn close_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// Result of a single receive
#[derive(Debug)]
pub enum Received {
    Message(Message),
    /// The frame could not be decoded; only this frame is lost
    Invalid(BridgeError),
    /// Peer hung up, the socket failed, or `close` was called
    Closed,
}

/// Duplex message transport used by the message pump
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Wait for the next message. Returns `Closed` immediately once closed.
    async fn receive(&self) -> Received;

    /// Write one message. Fails with `ConnectionClosed` once closed.
    async fn send(&self, message: Message) -> Result<()>;

    /// Close the underlying connection. Idempotent.
    async fn close(&self);

    /// Close, telling the peer why. Idempotent with `close`.
    async fn close_with_error(&self, reason: &str) {
        warn!("Closing transport: {}", reason);
        self.close().await;
    }

    fn is_closed(&self) -> bool;
}

/// [`MessageTransport`] over a tungstenite WebSocket stream
pub struct WsTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    closed: CancellationToken,
    close_started: AtomicBool,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an already-upgraded WebSocket
    pub fn open(socket: WebSocketStream<S>) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: CancellationToken::new(),
            close_started: AtomicBool::new(false),
        }
    }

    async fn shutdown_sink(&self, frame: Option<CloseFrame<'static>>) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();

        let result = tokio::time::timeout(CLOSE_TIMEOUT, async {
            let mut sink = self.sink.lock().await;
            if let Some(frame) = frame {
                sink.send(WsMessage::Close(Some(frame))).await?;
            }
            sink.close().await
        })
        .await;

        match result {
            Ok(Ok(())) => debug!("WebSocket closed"),
            // Already closed by the peer; nothing left to do
            Ok(Err(e)) => debug!("WebSocket close: {}", e),
            Err(_) => warn!("Timed out closing WebSocket"),
        }
    }
}

fn decode(text: &str) -> Received {
    trace!("recv: {}", text);
    match Message::from_text(text) {
        Ok(message) => Received::Message(message),
        Err(error) => Received::Invalid(error),
    }
}

#[async_trait]
impl<S> MessageTransport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn receive(&self) -> Received {
        let mut stream = tokio::select! {
            _ = self.closed.cancelled() => return Received::Closed,
            guard = self.stream.lock() => guard,
        };

        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => return Received::Closed,
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(WsMessage::Text(text))) => return decode(&text),
                Some(Ok(WsMessage::Binary(bytes))) => {
                    return match String::from_utf8(bytes) {
                        Ok(text) => decode(&text),
                        Err(_) => Received::Invalid(BridgeError::Decode(
                            "binary frame is not valid UTF-8".to_string(),
                        )),
                    };
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!("Peer sent close frame: {:?}", frame);
                    self.closed.cancel();
                    return Received::Closed;
                }
                // Ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("WebSocket read failed: {}", e);
                    self.closed.cancel();
                    return Received::Closed;
                }
                None => {
                    self.closed.cancel();
                    return Received::Closed;
                }
            }
        }
    }

    async fn send(&self, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::ConnectionClosed);
        }

        let text = message.to_text()?;
        trace!("send: {}", text);

        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(text)).await.map_err(|e| {
            self.closed.cancel();
            BridgeError::TransportFailure(e.to_string())
        })
    }

    async fn close(&self) {
        self.shutdown_sink(None).await;
    }

    async fn close_with_error(&self, reason: &str) {
        warn!("Closing transport: {}", reason);
        let frame = CloseFrame {
            code: CloseCode::Error,
            reason: close_reason(reason).into(),
        };
        self.shutdown_sink(Some(frame)).await;
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
