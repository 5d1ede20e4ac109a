//! Wire schema exchanged with subordinate contexts.

use serde::{Deserialize, Serialize};

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Which path produced an outbound message. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    /// Fan-out from the broadcast hub.
    #[serde(rename = "host-registry")]
    Registry,
    /// A synchronizer that is registered with the hub.
    #[serde(rename = "host-context")]
    Context,
    /// A synchronizer running without a hub.
    #[serde(rename = "host-standalone")]
    Standalone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "DARK_MODE")]
    DarkMode {
        value: bool,
        timestamp: i64,
        source: Source,
    },
    #[serde(rename = "REQUEST_READY")]
    RequestReady { timestamp: i64, source: Source },
}

impl OutboundMessage {
    pub fn dark_mode(value: bool, source: Source) -> Self {
        OutboundMessage::DarkMode {
            value,
            timestamp: now_millis(),
            source,
        }
    }

    pub fn request_ready(source: Source) -> Self {
        OutboundMessage::RequestReady {
            timestamp: now_millis(),
            source,
        }
    }

    /// The mode value carried, if this is a `DARK_MODE` message.
    pub fn mode_value(&self) -> Option<bool> {
        match self {
            OutboundMessage::DarkMode { value, .. } => Some(*value),
            OutboundMessage::RequestReady { .. } => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages consumed from a subordinate context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "SHINY_READY")]
    Ready,
}

/// A message event as seen by the host: declared sender origin plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub origin: String,
    pub data: serde_json::Value,
}

impl InboundEvent {
    pub fn new(origin: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            origin: origin.into(),
            data,
        }
    }

    /// A `SHINY_READY` event claiming to come from `origin`.
    pub fn ready(origin: impl Into<String>) -> Self {
        Self::new(origin, serde_json::json!({ "type": "SHINY_READY" }))
    }

    /// Decode the payload if, and only if, the declared origin is exactly
    /// `trusted_origin`. Unknown message types decode to `None`.
    pub fn accept(&self, trusted_origin: &str) -> Option<InboundMessage> {
        if self.origin != trusted_origin {
            return None;
        }
        InboundMessage::deserialize(&self.data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dark_mode_wire_shape() {
        let msg = OutboundMessage::DarkMode {
            value: true,
            timestamp: 1_700_000_000_000,
            source: Source::Registry,
        };
        let v: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "DARK_MODE",
                "value": true,
                "timestamp": 1_700_000_000_000_i64,
                "source": "host-registry",
            })
        );
    }

    #[test]
    fn request_ready_wire_shape() {
        let msg = OutboundMessage::RequestReady {
            timestamp: 42,
            source: Source::Standalone,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({ "type": "REQUEST_READY", "timestamp": 42, "source": "host-standalone" })
        );
        assert_eq!(msg.mode_value(), None);
    }

    #[test]
    fn ready_accepted_from_trusted_origin() {
        let ev = InboundEvent::ready("https://sub.example");
        assert_eq!(
            ev.accept("https://sub.example"),
            Some(InboundMessage::Ready)
        );
    }

    #[test]
    fn ready_rejected_from_other_origin() {
        let ev = InboundEvent::ready("https://evil.example");
        assert_eq!(ev.accept("https://sub.example"), None);
        // Origins are compared exactly, no normalisation.
        let ev = InboundEvent::ready("https://sub.example/");
        assert_eq!(ev.accept("https://sub.example"), None);
    }

    #[test]
    fn unknown_type_ignored() {
        let ev = InboundEvent::new("https://sub.example", json!({ "type": "RESIZE", "h": 10 }));
        assert_eq!(ev.accept("https://sub.example"), None);
        let ev = InboundEvent::new("https://sub.example", json!("SHINY_READY"));
        assert_eq!(ev.accept("https://sub.example"), None);
    }

    #[test]
    fn timestamps_are_epoch_millis() {
        let before = now_millis();
        let msg = OutboundMessage::dark_mode(false, Source::Context);
        match msg {
            OutboundMessage::DarkMode { timestamp, value, .. } => {
                assert!(timestamp >= before);
                assert!(!value);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
