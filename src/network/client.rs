//! AgentLink Client
//!
//! Connects to a session server the way an agent does. Used by the `probe`
//! command and by the server tests.

use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream};

use super::connection::{Connection, ConnectionError, Incoming};
use crate::protocol::{CodecKind, DecodeError, Message, WireFrame};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Undecodable message from server: {0}")]
    Decode(#[from] DecodeError),

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// AgentLink Client
pub struct Client {
    conn: Connection<MaybeTlsStream<TcpStream>>,
}

impl Client {
    /// Open a WebSocket connection to `url` (e.g. `ws://127.0.0.1:3000`)
    pub async fn connect(url: &str, codec: CodecKind, timeout: Duration) -> ClientResult<Self> {
        tracing::info!("Connecting to {} ({} codec)", url, codec);

        let (stream, _response) = match tokio::time::timeout(timeout, connect_async(url)).await {
            Ok(result) => result.map_err(ConnectionError::from)?,
            Err(_) => return Err(ClientError::Timeout),
        };

        Ok(Self {
            conn: Connection::new(stream, codec.build(), url),
        })
    }

    /// Send a message to the server
    pub async fn send(&mut self, message: &Message) -> ClientResult<()> {
        self.conn.send(message).await?;
        Ok(())
    }

    /// Send a raw frame, bypassing the codec
    pub async fn send_frame(&mut self, frame: WireFrame) -> ClientResult<()> {
        self.conn.send_frame(frame).await?;
        Ok(())
    }

    /// Next message from the server, `None` once the server closes
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ClientResult<Option<Message>> {
        match self.conn.recv_timeout(timeout).await {
            Ok(Incoming::Message(message)) => Ok(Some(message)),
            Ok(Incoming::Malformed(e)) => Err(e.into()),
            Ok(Incoming::Closed(_)) => Ok(None),
            Err(ConnectionError::Timeout) => Err(ClientError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    /// Close the connection
    pub async fn close(&mut self) -> ClientResult<()> {
        self.conn.close().await?;
        Ok(())
    }
}
