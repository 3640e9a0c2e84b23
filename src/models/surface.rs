use serde::{Deserialize, Serialize};

/// Selectors the automation surface needs to find the input and submit
/// controls of an embedded responder page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetHints {
    #[serde(default)]
    pub input_selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_selector: Option<String>,
}

/// Commands sent to an automation surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SurfaceCommand {
    #[serde(rename_all = "camelCase")]
    InjectText {
        request_id: String,
        text: String,
        target_hints: TargetHints,
        submit: bool,
        #[serde(default, skip_serializing_if = "is_false")]
        skip_inject: bool,
    },
    #[serde(rename_all = "camelCase")]
    StartMonitoring { request_id: String },
    Stop,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Signals reported back by an automation surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SurfaceEvent {
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        request_id: String,
        #[serde(default)]
        status: String,
    },
    #[serde(rename_all = "camelCase")]
    ResponseChunk { request_id: String, text: String },
    #[serde(rename_all = "camelCase")]
    ResponseComplete { request_id: String, text: String },
    LocationChanged { url: String },
}

impl SurfaceEvent {
    /// Validate an untyped message. Unknown or malformed variants yield `None`.
    pub fn decode(value: serde_json::Value) -> Option<Self> {
        match serde_json::from_value::<SurfaceEvent>(value) {
            Ok(event) => Some(event),
            Err(e) => {
                log::debug!("Ignoring unrecognized surface message: {}", e);
                None
            }
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            SurfaceEvent::Heartbeat { request_id, .. }
            | SurfaceEvent::ResponseChunk { request_id, .. }
            | SurfaceEvent::ResponseComplete { request_id, .. } => Some(request_id),
            SurfaceEvent::LocationChanged { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inject_wire_shape() {
        let cmd = SurfaceCommand::InjectText {
            request_id: "r1".into(),
            text: "hello".into(),
            target_hints: TargetHints {
                input_selector: "textarea".into(),
                submit_selector: Some("button[type=submit]".into()),
                response_selector: None,
            },
            submit: true,
            skip_inject: true,
        };
        let value = serde_json::to_value(&cmd).expect("serialize");
        assert_eq!(
            value,
            json!({
                "type": "INJECT_TEXT",
                "requestId": "r1",
                "text": "hello",
                "targetHints": {"inputSelector": "textarea", "submitSelector": "button[type=submit]"},
                "submit": true,
                "skipInject": true,
            })
        );
    }

    #[test]
    fn test_skip_inject_omitted_when_false() {
        let cmd = SurfaceCommand::InjectText {
            request_id: "r1".into(),
            text: "hello".into(),
            target_hints: TargetHints::default(),
            submit: false,
            skip_inject: false,
        };
        let value = serde_json::to_value(&cmd).expect("serialize");
        assert!(value.get("skipInject").is_none());
        assert_eq!(value["submit"], json!(false));
    }

    #[test]
    fn test_decode_known_events() {
        let chunk = SurfaceEvent::decode(json!({"type": "RESPONSE_CHUNK", "requestId": "r9", "text": "par"}));
        assert_eq!(
            chunk,
            Some(SurfaceEvent::ResponseChunk { request_id: "r9".into(), text: "par".into() })
        );

        let beat = SurfaceEvent::decode(json!({"type": "HEARTBEAT", "requestId": "r9"}))
            .expect("heartbeat without status");
        assert_eq!(beat.request_id(), Some("r9"));
    }

    #[test]
    fn test_decode_rejects_unknown_and_malformed() {
        assert!(SurfaceEvent::decode(json!({"type": "SCREENSHOT", "requestId": "r1"})).is_none());
        assert!(SurfaceEvent::decode(json!({"type": "RESPONSE_COMPLETE", "requestId": "r1"})).is_none());
        assert!(SurfaceEvent::decode(json!("RESPONSE_COMPLETE")).is_none());
    }
}
