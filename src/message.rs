//! Outbound message model and routing-key conventions
//!
//! A [`PendingMessage`] is an opaque JSON body plus the routing key it is
//! published with. The emergency-route helpers live here so that the
//! return handler and callers agree on what "already rerouted" means.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Routing key used for messages the broker could not route
pub const EMERGENCY_ROUTING_KEY: &str = "UNROUTABLE.UNROUTABLE";

/// Body field that carries the routing key a rerouted message was first sent with
pub const ORIGINAL_ROUTING_KEY_FIELD: &str = "original_routing_key";

/// Exchange used when the configured one does not exist on the broker
pub const DEFAULT_FALLBACK_EXCHANGE: &str = "FALLBACK";

const EMERGENCY_SEGMENT: &str = "UNROUTABLE";

/// A message waiting to be published or confirmed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub routing_key: String,
    pub body: Value,
}

impl PendingMessage {
    pub fn new<S: Into<String>>(routing_key: S, body: Value) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
        }
    }

    /// Build a message from any serializable payload
    pub fn from_serializable<S, T>(routing_key: S, payload: &T) -> Result<Self, serde_json::Error>
    where
        S: Into<String>,
        T: Serialize + ?Sized,
    {
        Ok(Self::new(routing_key, serde_json::to_value(payload)?))
    }

    /// Bytes sent on the wire
    pub fn encode_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.body)
    }

    pub fn is_emergency_routed(&self) -> bool {
        is_emergency_route(&self.routing_key)
    }

    /// Rewrite this message for the emergency route, keeping the original key in the body
    pub fn into_emergency(self, emergency_key: &str) -> Self {
        let original_key = self.routing_key;
        let body = match self.body {
            Value::Object(mut map) => {
                map.insert(
                    ORIGINAL_ROUTING_KEY_FIELD.to_string(),
                    Value::String(original_key),
                );
                Value::Object(map)
            }
            other => json!({
                ORIGINAL_ROUTING_KEY_FIELD: original_key,
                "payload": other,
            }),
        };

        Self {
            routing_key: emergency_key.to_string(),
            body,
        }
    }

    /// Original routing key recorded by [`PendingMessage::into_emergency`], if any
    pub fn original_routing_key(&self) -> Option<&str> {
        self.body
            .get(ORIGINAL_ROUTING_KEY_FIELD)
            .and_then(Value::as_str)
    }
}

/// Whether a routing key already points at the emergency route
pub fn is_emergency_route(routing_key: &str) -> bool {
    routing_key == EMERGENCY_ROUTING_KEY
        || routing_key
            .split('.')
            .next()
            .is_some_and(|segment| segment.eq_ignore_ascii_case(EMERGENCY_SEGMENT))
}

/// Decode a returned body, tolerating non-JSON payloads
pub fn decode_body(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emergency_route_detection() {
        assert!(is_emergency_route(EMERGENCY_ROUTING_KEY));
        assert!(is_emergency_route("UNROUTABLE.fresh"));
        assert!(is_emergency_route("unroutable.anything"));
        assert!(!is_emergency_route("prefix.HASH.fresh.publi-ds-repli"));
        assert!(!is_emergency_route("prefix.UNROUTABLE"));
        assert!(!is_emergency_route(""));
    }

    #[test]
    fn test_into_emergency_keeps_original_key_in_object() {
        let message = PendingMessage::new(
            "prefix.HASH.fresh.publi-file-orig",
            json!({"handle": "hdl:21.14100/abc", "operation": "publish"}),
        );

        let rerouted = message.into_emergency(EMERGENCY_ROUTING_KEY);

        assert_eq!(rerouted.routing_key, EMERGENCY_ROUTING_KEY);
        assert_eq!(
            rerouted.original_routing_key(),
            Some("prefix.HASH.fresh.publi-file-orig")
        );
        assert_eq!(rerouted.body["handle"], "hdl:21.14100/abc");
        assert!(rerouted.is_emergency_routed());
    }

    #[test]
    fn test_into_emergency_wraps_non_object_body() {
        let message = PendingMessage::new("some.key", json!([1, 2, 3]));
        let rerouted = message.into_emergency(EMERGENCY_ROUTING_KEY);

        assert_eq!(rerouted.original_routing_key(), Some("some.key"));
        assert_eq!(rerouted.body["payload"], json!([1, 2, 3]));
    }

    #[test]
    fn test_decode_body_falls_back_to_string() {
        assert_eq!(decode_body(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(decode_body(b"not json"), json!("not json"));
    }

    #[test]
    fn test_from_serializable() {
        #[derive(Serialize)]
        struct Registration<'a> {
            handle: &'a str,
            version: u32,
        }

        let message = PendingMessage::from_serializable(
            "key",
            &Registration {
                handle: "hdl:1/2",
                version: 3,
            },
        )
        .unwrap();

        assert_eq!(message.body, json!({"handle": "hdl:1/2", "version": 3}));
        assert_eq!(message.encode_body().unwrap(), br#"{"handle":"hdl:1/2","version":3}"#);
    }
}
