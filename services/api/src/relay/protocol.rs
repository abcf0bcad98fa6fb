//! Defines the wire format between the telephony relay and this service.
//!
//! Inbound traffic arrives as [`RelayEvent`]s, one per WebSocket lifecycle step
//! or text frame. The text frames themselves carry an [`InboundMessage`] tagged
//! by `type`. Replies go back to the caller as [`OutboundMessage`]s, and every
//! event is answered with an [`Ack`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// Addressing and routing metadata attached to every event by the transport.
#[derive(Deserialize, Serialize, ToSchema, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub connection_id: Option<String>,
    pub route_key: Option<String>,
    pub domain_name: Option<String>,
    pub stage: Option<String>,
}

/// One inbound unit of work.
#[derive(Deserialize, Serialize, ToSchema, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayEvent {
    #[serde(default)]
    pub request_context: RequestContext,
    /// Raw JSON text of the relay message, present on the data route only.
    pub body: Option<String>,
}

impl RelayEvent {
    /// Builds an event for a connection terminated by this process.
    pub fn local(connection_id: &str, route: RouteKey, body: Option<String>) -> Self {
        Self {
            request_context: RequestContext {
                connection_id: Some(connection_id.to_string()),
                route_key: Some(route.as_str().to_string()),
                domain_name: None,
                stage: None,
            },
            body,
        }
    }

    pub fn route(&self) -> RouteKey {
        RouteKey::parse(self.request_context.route_key.as_deref().unwrap_or(""))
    }
}

/// Selects the control path (connect/disconnect) or the data path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKey {
    Connect,
    Disconnect,
    Default,
    Unknown(String),
}

impl RouteKey {
    /// Accepts both the `$`-prefixed gateway names and the bare names.
    pub fn parse(raw: &str) -> Self {
        match raw.trim_start_matches('$') {
            "connect" => RouteKey::Connect,
            "disconnect" => RouteKey::Disconnect,
            "default" | "message" => RouteKey::Default,
            _ => RouteKey::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RouteKey::Connect => "$connect",
            RouteKey::Disconnect => "$disconnect",
            RouteKey::Default => "$default",
            RouteKey::Unknown(raw) => raw,
        }
    }
}

/// Messages sent by the telephony relay on the data route.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    /// Sent once when the call is bridged to this service.
    Setup {
        #[serde(rename = "callSid")]
        call_sid: Option<String>,
        #[serde(rename = "accountSid")]
        account_sid: Option<String>,
        from: Option<String>,
        to: Option<String>,
    },
    /// A finished caller utterance, already transcribed.
    Prompt {
        #[serde(rename = "callSid")]
        call_sid: Option<String>,
        /// Absent or `null` when the platform transcribed nothing.
        #[serde(rename = "voicePrompt", default)]
        voice_prompt: Option<String>,
        confidence: Option<f64>,
        #[serde(rename = "promptDuration")]
        prompt_duration: Option<f64>,
    },
    /// The caller started speaking over the reply.
    Interrupt {
        #[serde(rename = "callSid")]
        call_sid: Option<String>,
    },
    /// Any message type this service does not act on.
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Setup { .. } => "setup",
            InboundMessage::Prompt { .. } => "prompt",
            InboundMessage::Interrupt { .. } => "interrupt",
            InboundMessage::Unknown => "unknown",
        }
    }

    pub fn call_sid(&self) -> Option<&str> {
        match self {
            InboundMessage::Setup { call_sid, .. }
            | InboundMessage::Prompt { call_sid, .. }
            | InboundMessage::Interrupt { call_sid } => call_sid.as_deref(),
            InboundMessage::Unknown => None,
        }
    }
}

/// Messages pushed back to the caller for speech synthesis.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Text { token: String, last: bool },
}

impl OutboundMessage {
    pub fn text(token: impl Into<String>, last: bool) -> Self {
        OutboundMessage::Text {
            token: token.into(),
            last,
        }
    }
}

/// The acknowledgement returned to the transport for every event.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            status_code: 200,
            headers: default_headers(),
            body: None,
        }
    }

    /// An error acknowledgement carrying `{"error": message}` as its body.
    pub fn error(status_code: u16, message: &str) -> Self {
        Self {
            status_code,
            headers: default_headers(),
            body: Some(serde_json::json!({ "error": message }).to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status_code == 200
    }
}

fn default_headers() -> BTreeMap<String, String> {
    [
        ("Content-Type", "application/json"),
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Headers", "Content-Type,Authorization"),
        ("Access-Control-Allow-Methods", "OPTIONS,POST,GET"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_route_key_accepts_gateway_and_bare_names() {
        assert_eq!(RouteKey::parse("$connect"), RouteKey::Connect);
        assert_eq!(RouteKey::parse("disconnect"), RouteKey::Disconnect);
        assert_eq!(RouteKey::parse("$default"), RouteKey::Default);
        assert_eq!(RouteKey::parse("message"), RouteKey::Default);
        assert_eq!(
            RouteKey::parse("$custom"),
            RouteKey::Unknown("$custom".to_string())
        );
    }

    #[test]
    fn test_relay_event_deserialization() {
        let event: RelayEvent = serde_json::from_value(json!({
            "requestContext": {
                "connectionId": "test-connection-id",
                "routeKey": "$default",
                "domainName": "test-domain.execute-api.us-east-1.amazonaws.com",
                "stage": "prod"
            },
            "body": "{\"type\":\"interrupt\"}"
        }))
        .unwrap();

        assert_eq!(
            event.request_context.connection_id.as_deref(),
            Some("test-connection-id")
        );
        assert_eq!(event.route(), RouteKey::Default);
        assert_eq!(event.request_context.stage.as_deref(), Some("prod"));
    }

    #[test]
    fn test_relay_event_without_context_still_parses() {
        let event: RelayEvent = serde_json::from_value(json!({})).unwrap();
        assert_eq!(event.request_context, RequestContext::default());
        assert_eq!(event.route(), RouteKey::Unknown(String::new()));
    }

    #[test]
    fn test_setup_message_deserialization() {
        let msg: InboundMessage = serde_json::from_value(json!({
            "type": "setup",
            "callSid": "CA123",
            "accountSid": "AC123",
            "from": "+15551234567",
            "to": "+15557654321"
        }))
        .unwrap();

        assert_eq!(msg.kind(), "setup");
        assert_eq!(msg.call_sid(), Some("CA123"));
    }

    #[test]
    fn test_prompt_message_deserialization() {
        let msg: InboundMessage = serde_json::from_value(json!({
            "type": "prompt",
            "callSid": "CA123",
            "voicePrompt": "Hello, how are you?",
            "confidence": 0.95,
            "promptDuration": 1.5
        }))
        .unwrap();

        match msg {
            InboundMessage::Prompt {
                call_sid,
                voice_prompt,
                confidence,
                prompt_duration,
            } => {
                assert_eq!(call_sid.as_deref(), Some("CA123"));
                assert_eq!(voice_prompt.as_deref(), Some("Hello, how are you?"));
                assert_eq!(confidence, Some(0.95));
                assert_eq!(prompt_duration, Some(1.5));
            }
            other => panic!("Expected prompt, got {:?}", other),
        }
    }

    #[test]
    fn test_prompt_without_call_sid_or_text() {
        let msg: InboundMessage = serde_json::from_value(json!({"type": "prompt"})).unwrap();
        assert_eq!(msg.call_sid(), None);
        assert!(matches!(
            msg,
            InboundMessage::Prompt {
                voice_prompt: None,
                ..
            }
        ));
    }

    #[test]
    fn test_prompt_with_null_text_still_parses() {
        let msg: InboundMessage = serde_json::from_str(
            r#"{"type":"prompt","callSid":"CA1","voicePrompt":null}"#,
        )
        .unwrap();
        assert_eq!(msg.call_sid(), Some("CA1"));
        assert!(matches!(
            msg,
            InboundMessage::Prompt {
                voice_prompt: None,
                ..
            }
        ));
    }

    #[test]
    fn test_unrecognized_type_is_unknown() {
        let msg: InboundMessage =
            serde_json::from_value(json!({"type": "dtmf", "digit": "1"})).unwrap();
        assert_eq!(msg, InboundMessage::Unknown);
    }

    #[test]
    fn test_missing_type_is_an_error() {
        assert!(serde_json::from_value::<InboundMessage>(json!({"callSid": "CA1"})).is_err());
    }

    #[test]
    fn test_outbound_text_serialization() {
        let msg = OutboundMessage::text("Hi there", true);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "text", "token": "Hi there", "last": true})
        );
    }

    #[test]
    fn test_ack_shapes() {
        let ok = serde_json::to_value(Ack::ok()).unwrap();
        assert_eq!(ok["statusCode"], 200);
        assert_eq!(ok["headers"]["Access-Control-Allow-Origin"], "*");
        assert!(ok.get("body").is_none());

        let err = Ack::error(500, "boom");
        assert!(!err.is_ok());
        let body: serde_json::Value = serde_json::from_str(err.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({"error": "boom"}));
    }
}
