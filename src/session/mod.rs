//! Session module - Per-connection protocol state
//!
//! Handles:
//! - Session identity and lifecycle state
//! - Feature flags and the config snapshot sent to agents
//! - License policies and the message-dispatch engine

mod engine;
mod license;

pub use engine::{EngineOptions, SessionEngine};
pub use license::{AlwaysValid, DomainAllowlist, LicensePolicy, Revoked};

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::{ConfigSnapshot, FeatureMap, HandshakeInfo, UiLayout};

/// Version reported until the agent says otherwise
pub const UNKNOWN_VERSION: &str = "unknown";

/// Theme sent with every config snapshot
pub const DEFAULT_THEME: &str = "dark";

/// Features every session starts with
pub const DEFAULT_FEATURES: [(&str, bool); 3] = [
    ("quickLoot", true),
    ("autoHeal", false),
    ("tooltipHints", true),
];

/// Build the default feature map
pub fn default_features() -> FeatureMap {
    DEFAULT_FEATURES
        .iter()
        .map(|(name, enabled)| (name.to_string(), *enabled))
        .collect()
}

/// Protocol progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no handshake yet
    Open,
    /// Identity recorded and license evaluated
    Handshaken,
    /// Connection ended
    Closed,
}

/// Server-side state for one live connection
#[derive(Debug, Clone)]
pub struct Session {
    /// Correlation id for logs, never sent to the agent
    pub id: Uuid,
    /// Remote peer address, if known
    pub peer: Option<SocketAddr>,
    pub state: SessionState,
    pub version: String,
    pub domain: Option<String>,
    pub tab_id: Option<String>,
    pub licensed: bool,
    pub features: FeatureMap,
    pub theme: String,
    pub ui: UiLayout,
    /// Messages dispatched through the engine
    pub messages_handled: u64,
    /// Inbound frames dropped as undecodable
    pub decode_errors: u64,
    opened_at: Instant,
}

impl Session {
    /// Create a session for a freshly opened connection
    pub fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            state: SessionState::Open,
            version: UNKNOWN_VERSION.to_string(),
            domain: None,
            tab_id: None,
            licensed: false,
            features: default_features(),
            theme: DEFAULT_THEME.to_string(),
            ui: UiLayout::default(),
            messages_handled: 0,
            decode_errors: 0,
            opened_at: Instant::now(),
        }
    }

    /// Replace the reported identity with the one from a handshake
    pub fn record_identity(&mut self, info: HandshakeInfo) {
        self.version = info.version.unwrap_or_else(|| UNKNOWN_VERSION.to_string());
        self.domain = info.domain;
        self.tab_id = info.tab_id;
    }

    /// Upsert a single feature flag
    pub fn set_feature(&mut self, feature: impl Into<String>, enabled: bool) {
        self.features.insert(feature.into(), enabled);
    }

    /// Complete config snapshot for the current state
    pub fn config_snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            version: self.version.clone(),
            theme: self.theme.clone(),
            features: self.features.clone(),
            ui: self.ui.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Time since the connection opened
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}
