//! Protocol module - Defines the agent session protocol
//!
//! Every message on the wire is a self-describing envelope:
//! - `action`: string tag selecting the message kind
//! - `data`: optional action-specific payload
//!
//! The envelope is carried either as JSON text frames or as CBOR binary
//! frames, selected per deployment through [`CodecKind`].

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Protocol version reported by `agentlink info`
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for the session server
pub const DEFAULT_PORT: u16 = 3000;

/// Action tags understood by the protocol
pub mod actions {
    pub const HANDSHAKE: &str = "handshake";
    pub const PING: &str = "ping";
    pub const REQUEST_CONFIG: &str = "request-config";
    pub const TOGGLE_FEATURE: &str = "toggle-feature";
    pub const MESSAGE: &str = "message";

    pub const CONFIG: &str = "config";
    pub const LICENSE: &str = "license";
    pub const PONG: &str = "pong";
    pub const SHUTDOWN: &str = "shutdown";
    pub const WELCOME: &str = "welcome";
    pub const ECHO: &str = "echo";

    /// Every action with a dedicated message variant
    pub const KNOWN: [&str; 11] = [
        HANDSHAKE,
        PING,
        REQUEST_CONFIG,
        TOGGLE_FEATURE,
        MESSAGE,
        CONFIG,
        LICENSE,
        PONG,
        SHUTDOWN,
        WELCOME,
        ECHO,
    ];

    pub fn is_known(action: &str) -> bool {
        KNOWN.contains(&action)
    }
}
