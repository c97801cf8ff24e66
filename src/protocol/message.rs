//! Protocol message definitions
//!
//! Defines every action exchanged between an agent and the server, and the
//! envelope those actions travel in.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::actions;
use super::DecodeError;

/// Feature name to enabled flag
pub type FeatureMap = BTreeMap<String, bool>;

/// Identity reported by the agent in a `handshake`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
}

/// Payload of `toggle-feature`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureToggle {
    pub feature: String,
    pub enabled: bool,
}

/// Presentation defaults sent with every config snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiLayout {
    pub layout: String,
    pub position: String,
    pub show_overlay: bool,
}

impl Default for UiLayout {
    fn default() -> Self {
        Self {
            layout: "compact".to_string(),
            position: "bottom-right".to_string(),
            show_overlay: true,
        }
    }
}

/// Payload of `config`
///
/// Always complete: agents merge it into their local settings and a missing
/// key breaks that merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub version: String,
    pub theme: String,
    pub features: FeatureMap,
    pub ui: UiLayout,
}

/// Payload of `license`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseStatus {
    pub valid: bool,
    pub key: String,
    pub reason: Option<String>,
}

impl LicenseStatus {
    pub fn valid(key: impl Into<String>) -> Self {
        Self {
            valid: true,
            key: key.into(),
            reason: None,
        }
    }

    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            key: key.into(),
            reason: Some(reason.into()),
        }
    }
}

/// Payload of the legacy `welcome` greeting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub server: String,
    pub message: String,
}

/// A message whose action has no dedicated variant.
///
/// Only constructible for actions the protocol does not know, so it always
/// decodes back to itself.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownMessage {
    action: String,
    data: Value,
}

impl UnknownMessage {
    /// Returns `None` for empty or known actions
    pub fn new(action: impl Into<String>, data: Value) -> Option<Self> {
        let action = action.into();
        if action.is_empty() || actions::is_known(&action) {
            return None;
        }
        Some(Self { action, data })
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn data(&self) -> &Value {
        &self.data
    }
}

/// All protocol messages, in both directions
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Agent identifies itself and asks for its license
    Handshake(HandshakeInfo),

    /// Heartbeat
    Ping,

    /// Agent asks for the current config snapshot
    RequestConfig,

    /// Agent switches a feature on or off (license gated)
    ToggleFeature(FeatureToggle),

    /// Free-form agent message, logged only. `Value::Null` means no data.
    Freeform(Value),

    /// Full settings snapshot
    Config(ConfigSnapshot),

    /// License evaluation result
    License(LicenseStatus),

    /// Heartbeat reply, server time in milliseconds since the epoch
    Pong { time: u64 },

    /// Tells the agent to disable itself
    Shutdown,

    /// Legacy greeting sent on connect
    Welcome(Welcome),

    /// Legacy echo of a free-form message. `Value::Null` means no data.
    Echo(Value),

    /// Any action without a dedicated variant
    Unknown(UnknownMessage),
}

impl Message {
    /// The wire action tag
    pub fn action(&self) -> &str {
        match self {
            Message::Handshake(_) => actions::HANDSHAKE,
            Message::Ping => actions::PING,
            Message::RequestConfig => actions::REQUEST_CONFIG,
            Message::ToggleFeature(_) => actions::TOGGLE_FEATURE,
            Message::Freeform(_) => actions::MESSAGE,
            Message::Config(_) => actions::CONFIG,
            Message::License(_) => actions::LICENSE,
            Message::Pong { .. } => actions::PONG,
            Message::Shutdown => actions::SHUTDOWN,
            Message::Welcome(_) => actions::WELCOME,
            Message::Echo(_) => actions::ECHO,
            Message::Unknown(unknown) => unknown.action(),
        }
    }

    /// Build the wire envelope for this message
    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        let data = match self {
            Message::Handshake(info) => Some(serde_json::to_value(info)?),
            Message::ToggleFeature(toggle) => Some(serde_json::to_value(toggle)?),
            Message::Config(snapshot) => Some(serde_json::to_value(snapshot)?),
            Message::License(status) => Some(serde_json::to_value(status)?),
            Message::Welcome(welcome) => Some(serde_json::to_value(welcome)?),
            Message::Pong { time } => Some(serde_json::json!({ "time": time })),
            Message::Freeform(data) | Message::Echo(data) => non_null(data.clone()),
            Message::Unknown(unknown) => non_null(unknown.data.clone()),
            Message::Ping | Message::RequestConfig | Message::Shutdown => None,
        };

        Ok(Envelope {
            action: self.action().to_string(),
            data,
        })
    }
}

fn non_null(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        value => Some(value),
    }
}

/// The logical wire shape shared by every codec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    /// Extract an envelope from a decoded structured value
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut map) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let action = match map.remove("action") {
            Some(Value::String(action)) if !action.is_empty() => action,
            _ => return Err(DecodeError::MissingAction),
        };

        Ok(Self {
            action,
            data: map.remove("data").and_then(non_null),
        })
    }

    fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let data = self.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|e| DecodeError::InvalidPayload {
            action: self.action.clone(),
            reason: e.to_string(),
        })
    }

    fn payload_or_default<T>(&self) -> Result<T, DecodeError>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        match self.data {
            None => Ok(T::default()),
            Some(_) => self.payload(),
        }
    }
}

impl TryFrom<Envelope> for Message {
    type Error = DecodeError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let message = match envelope.action.as_str() {
            actions::HANDSHAKE => Message::Handshake(envelope.payload_or_default()?),
            actions::PING => Message::Ping,
            actions::REQUEST_CONFIG => Message::RequestConfig,
            actions::TOGGLE_FEATURE => Message::ToggleFeature(envelope.payload()?),
            actions::MESSAGE => Message::Freeform(envelope.data.unwrap_or(Value::Null)),
            actions::CONFIG => Message::Config(envelope.payload()?),
            actions::LICENSE => Message::License(envelope.payload()?),
            actions::PONG => {
                let pong: PongPayload = envelope.payload()?;
                Message::Pong { time: pong.time }
            }
            actions::SHUTDOWN => Message::Shutdown,
            actions::WELCOME => Message::Welcome(envelope.payload()?),
            actions::ECHO => Message::Echo(envelope.data.unwrap_or(Value::Null)),
            _ => Message::Unknown(UnknownMessage {
                action: envelope.action,
                data: envelope.data.unwrap_or(Value::Null),
            }),
        };
        Ok(message)
    }
}

#[derive(Deserialize)]
struct PongPayload {
    time: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: Value) -> Result<Message, DecodeError> {
        Envelope::from_value(value).and_then(Message::try_from)
    }

    #[test]
    fn test_handshake_fields() {
        let msg = decode(json!({
            "action": "handshake",
            "data": { "version": "2.1.9", "domain": "example.com", "tabId": "17", "extra": 1 }
        }))
        .unwrap();

        assert_eq!(
            msg,
            Message::Handshake(HandshakeInfo {
                version: Some("2.1.9".to_string()),
                domain: Some("example.com".to_string()),
                tab_id: Some("17".to_string()),
            })
        );
    }

    #[test]
    fn test_handshake_without_data() {
        let msg = decode(json!({ "action": "handshake" })).unwrap();
        assert_eq!(msg, Message::Handshake(HandshakeInfo::default()));
    }

    #[test]
    fn test_unknown_action_preserved() {
        let msg = decode(json!({ "action": "open-inventory", "data": { "slot": 3 } })).unwrap();

        match msg {
            Message::Unknown(unknown) => {
                assert_eq!(unknown.action(), "open-inventory");
                assert_eq!(unknown.data(), &json!({ "slot": 3 }));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_missing_action() {
        assert!(matches!(
            decode(json!({ "data": {} })),
            Err(DecodeError::MissingAction)
        ));
        assert!(matches!(
            decode(json!({ "action": 5 })),
            Err(DecodeError::MissingAction)
        ));
        assert!(matches!(
            decode(json!({ "action": "" })),
            Err(DecodeError::MissingAction)
        ));
        assert!(matches!(decode(json!([1, 2])), Err(DecodeError::NotAnObject)));
    }

    #[test]
    fn test_toggle_requires_fields() {
        let err = decode(json!({ "action": "toggle-feature", "data": { "feature": "autoHeal" } }))
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload { ref action, .. } if action == "toggle-feature"));

        let err = decode(json!({ "action": "toggle-feature" })).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload { .. }));
    }

    #[test]
    fn test_license_reason_serialized_as_null() {
        let envelope = Message::License(LicenseStatus::valid("KEY")).to_envelope().unwrap();
        assert_eq!(
            envelope.data,
            Some(json!({ "valid": true, "key": "KEY", "reason": null }))
        );
    }

    #[test]
    fn test_unknown_rejects_known_actions() {
        assert!(UnknownMessage::new("ping", Value::Null).is_none());
        assert!(UnknownMessage::new("", Value::Null).is_none());
        assert!(UnknownMessage::new("custom", Value::Null).is_some());
    }

    #[test]
    fn test_data_less_messages_have_no_data() {
        for msg in [Message::Ping, Message::Shutdown, Message::Freeform(Value::Null)] {
            assert_eq!(msg.to_envelope().unwrap().data, None);
        }
    }
}
