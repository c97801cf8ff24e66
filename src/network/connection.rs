//! Connection handling for AgentLink
//!
//! Wraps a WebSocket stream with a codec, including:
//! - Frame decoding into protocol messages
//! - Close and error detection
//! - Per-connection statistics

use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

use crate::protocol::{Codec, CodecError, DecodeError, Message, WireFrame};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Connection timeout")]
    Timeout,

    #[error("Send channel closed")]
    SendChannelClosed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// WebSocket established
    Open,
    /// Close handshake in progress
    Closing,
    /// Connection has been closed
    Closed,
}

/// Result of waiting for the next inbound frame
#[derive(Debug)]
pub enum Incoming {
    /// A decoded message
    Message(Message),
    /// A frame that could not be decoded; the connection stays usable
    Malformed(DecodeError),
    /// The peer closed the connection, with its close code if one was sent
    Closed(Option<u16>),
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// A WebSocket connection speaking the agent protocol
pub struct Connection<S> {
    /// Peer label for logs
    peer: String,
    /// The WebSocket stream
    stream: WebSocketStream<S>,
    /// Wire codec
    codec: Arc<dyn Codec>,
    /// Connection state
    state: ConnectionState,
    /// Statistics
    stats: ConnectionStats,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established WebSocket stream
    pub fn new(stream: WebSocketStream<S>, codec: Arc<dyn Codec>, peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            stream,
            codec,
            state: ConnectionState::Open,
            stats: ConnectionStats::default(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Encode and send a message
    pub async fn send(&mut self, message: &Message) -> ConnectionResult<()> {
        let frame = self.codec.encode(message)?;
        tracing::trace!(peer = %self.peer, action = message.action(), bytes = frame.len(), "Sending");
        self.send_frame(frame).await
    }

    /// Send several messages in order, stopping at the first failure
    pub async fn send_all(&mut self, messages: &[Message]) -> ConnectionResult<()> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    /// Send an already encoded frame
    pub async fn send_frame(&mut self, frame: WireFrame) -> ConnectionResult<()> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }

        let len = frame.len() as u64;
        let ws_message = match frame {
            WireFrame::Text(text) => WsMessage::Text(text),
            WireFrame::Binary(bytes) => WsMessage::Binary(bytes),
        };
        self.stream.send(ws_message).await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += len;

        Ok(())
    }

    /// Wait for the next protocol frame
    ///
    /// Control frames are handled by the WebSocket layer and skipped here.
    pub async fn recv(&mut self) -> ConnectionResult<Incoming> {
        loop {
            let ws_message = match self.stream.next().await {
                Some(result) => result?,
                None => {
                    self.state = ConnectionState::Closed;
                    return Ok(Incoming::Closed(None));
                }
            };

            let payload = match ws_message {
                WsMessage::Text(text) => text.into_bytes(),
                WsMessage::Binary(bytes) => bytes,
                WsMessage::Close(frame) => {
                    self.state = ConnectionState::Closing;
                    return Ok(Incoming::Closed(frame.map(|f| u16::from(f.code))));
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            };

            self.stats.messages_received += 1;
            self.stats.bytes_received += payload.len() as u64;

            return Ok(match self.codec.decode(&payload) {
                Ok(message) => Incoming::Message(message),
                Err(e) => Incoming::Malformed(e),
            });
        }
    }

    /// Wait for the next protocol frame with a timeout
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ConnectionResult<Incoming> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Close the connection normally, tolerating a peer that is already gone
    pub async fn close(&mut self) -> ConnectionResult<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.state = ConnectionState::Closing;

        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(""),
        };
        let result = match self.stream.close(Some(frame)).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        };

        self.state = ConnectionState::Closed;
        result
    }
}

/// A handle for pushing messages to a connection from outside its task
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Message>,
    connected: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Self {
            sender,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Queue a message for this connection
    pub async fn send(&self, message: Message) -> ConnectionResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        self.sender
            .send(message)
            .await
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the connection as disconnected
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_after_disconnect() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(tx);

        tokio_test::assert_ok!(handle.send(Message::Ping).await);
        assert_eq!(rx.recv().await, Some(Message::Ping));

        handle.mark_disconnected();
        assert!(!handle.is_connected());
        assert!(matches!(
            handle.send(Message::Ping).await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_handle_with_dropped_receiver() {
        let (tx, rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(tx);
        drop(rx);

        assert!(matches!(
            handle.send(Message::Shutdown).await,
            Err(ConnectionError::SendChannelClosed)
        ));
    }
}
