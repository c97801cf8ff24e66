//! Network module - Handles WebSocket communication with agents
//!
//! Provides:
//! - Server for accepting agent connections
//! - Client for probing a running server
//! - Connection wrapper and the live session registry

mod server;
mod client;
mod connection;
mod registry;

pub use server::*;
pub use client::*;
pub use connection::*;

use crate::protocol::CodecKind;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,
    /// Interface to bind to
    pub bind_address: String,
    /// Wire encoding
    pub codec: CodecKind,
    /// Capacity of each session's outbound queue
    pub channel_capacity: usize,
    /// Time allowed for connecting, including the WebSocket upgrade (milliseconds)
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::protocol::DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            codec: CodecKind::default(),
            channel_capacity: 64,
            connect_timeout_ms: 5000,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    /// Address string handed to the listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
