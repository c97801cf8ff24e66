//! Session engine
//!
//! Applies the session state machine: each inbound message may update the
//! session and yields the outbound messages to send, in order.
//!
//! | Action           | Effect                               | Replies                       |
//! |------------------|--------------------------------------|-------------------------------|
//! | `handshake`      | record identity, evaluate license    | `license`, then `config` or `shutdown` |
//! | `ping`           | none                                 | `pong`                        |
//! | `request-config` | none                                 | `config`                      |
//! | `toggle-feature` | upsert feature (licensed only)       | `config` (licensed only)      |
//! | `message`        | logged                               | `echo` if enabled             |
//! | anything else    | logged as unrecognized               | none                          |

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{LicensePolicy, Session, SessionState};
use crate::protocol::{DecodeError, FeatureToggle, HandshakeInfo, Message, Welcome};

/// Optional legacy behaviours
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Greet new connections with `welcome`
    pub send_welcome: bool,
    /// Answer free-form `message` actions with `echo`
    pub echo_messages: bool,
    /// Server name used in the greeting
    pub server_name: String,
}

/// Drives every session through the protocol
pub struct SessionEngine {
    policy: Arc<dyn LicensePolicy>,
    options: EngineOptions,
}

impl SessionEngine {
    pub fn new(policy: Arc<dyn LicensePolicy>, options: EngineOptions) -> Self {
        Self { policy, options }
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    /// Called once when the connection opens
    pub fn open(&self, session: &mut Session) -> Vec<Message> {
        tracing::info!(session = %session.id, peer = ?session.peer, "Session opened");

        if self.options.send_welcome {
            vec![Message::Welcome(Welcome {
                server: self.options.server_name.clone(),
                message: "connected".to_string(),
            })]
        } else {
            Vec::new()
        }
    }

    /// Apply one inbound message and return the replies in send order
    pub async fn handle(&self, session: &mut Session, message: Message) -> Vec<Message> {
        if session.is_closed() {
            tracing::debug!(session = %session.id, action = message.action(), "Ignoring message for closed session");
            return Vec::new();
        }

        session.messages_handled += 1;
        tracing::debug!(session = %session.id, action = message.action(), "Handling message");

        match message {
            Message::Handshake(info) => self.handshake(session, info).await,
            Message::Ping => vec![Message::Pong { time: now_millis() }],
            Message::RequestConfig => vec![Message::Config(session.config_snapshot())],
            Message::ToggleFeature(toggle) => self.toggle_feature(session, toggle),
            Message::Freeform(data) => {
                tracing::info!(session = %session.id, data = %data, "Agent message");
                if self.options.echo_messages {
                    vec![Message::Echo(data)]
                } else {
                    Vec::new()
                }
            }
            Message::Unknown(unknown) => {
                tracing::warn!(session = %session.id, action = unknown.action(), "Unrecognized action");
                Vec::new()
            }
            message @ (Message::Config(_)
            | Message::License(_)
            | Message::Pong { .. }
            | Message::Shutdown
            | Message::Welcome(_)
            | Message::Echo(_)) => {
                tracing::warn!(
                    session = %session.id,
                    action = message.action(),
                    "Unrecognized action (server-only message sent by agent)"
                );
                Vec::new()
            }
        }
    }

    /// Record an inbound frame that could not be decoded
    pub fn decode_failed(&self, session: &mut Session, error: &DecodeError) {
        session.decode_errors += 1;
        tracing::warn!(session = %session.id, error = %error, "Dropping undecodable message");
    }

    /// Called once when the connection closes or fails
    pub fn close(&self, session: &mut Session, reason: &str) {
        if session.is_closed() {
            return;
        }
        session.state = SessionState::Closed;
        tracing::info!(
            session = %session.id,
            peer = ?session.peer,
            messages = session.messages_handled,
            decode_errors = session.decode_errors,
            duration_ms = session.age().as_millis() as u64,
            "Session closed: {}",
            reason
        );
    }

    async fn handshake(&self, session: &mut Session, info: HandshakeInfo) -> Vec<Message> {
        session.record_identity(info);
        session.state = SessionState::Handshaken;

        let status = self.policy.evaluate(session).await;
        session.licensed = status.valid;

        tracing::info!(
            session = %session.id,
            version = %session.version,
            domain = ?session.domain,
            tab = ?session.tab_id,
            policy = self.policy.name(),
            licensed = status.valid,
            "Handshake complete"
        );

        let follow_up = if status.valid {
            Message::Config(session.config_snapshot())
        } else {
            tracing::warn!(session = %session.id, reason = ?status.reason, "License refused, shutting agent down");
            Message::Shutdown
        };

        vec![Message::License(status), follow_up]
    }

    fn toggle_feature(&self, session: &mut Session, toggle: FeatureToggle) -> Vec<Message> {
        if !session.licensed {
            tracing::debug!(session = %session.id, feature = %toggle.feature, "Ignoring toggle from unlicensed session");
            return Vec::new();
        }

        tracing::info!(session = %session.id, feature = %toggle.feature, enabled = toggle.enabled, "Feature toggled");
        session.set_feature(toggle.feature, toggle.enabled);
        vec![Message::Config(session.config_snapshot())]
    }
}

/// Current server time in milliseconds since the epoch
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
