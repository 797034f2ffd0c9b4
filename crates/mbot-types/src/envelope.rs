//! [`Envelope`] – the JSON wire unit.
//!
//! One JSON object per WebSocket frame:
//!
//! ```text
//! {"type": "request"|"publish"|"subscribe"|"unsubscribe"|"init", "channel": "<topic>", "dtype": "<type name>", "data": <any>}
//! {"type": "response", "channel": "<topic>", "dtype": "<type name>", "data": <any>}
//! {"type": "error", "msg": "<text>"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::BridgeError;

/// Well-known meta-topic answering with the bridge host's name.
pub const HOSTNAME_CHANNEL: &str = "HOSTNAME";

/// Well-known meta-topic answering with the registry headers.
pub const CHANNELS_CHANNEL: &str = "CHANNELS";

/// The `type` tag of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Init,
    Request,
    Publish,
    Response,
    Subscribe,
    Unsubscribe,
    Error,
}

impl MessageKind {
    fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "init" => MessageKind::Init,
            "request" => MessageKind::Request,
            "publish" => MessageKind::Publish,
            "response" => MessageKind::Response,
            "subscribe" => MessageKind::Subscribe,
            "unsubscribe" => MessageKind::Unsubscribe,
            "error" => MessageKind::Error,
            _ => return None,
        })
    }

    /// Whether an envelope of this kind must carry a `channel`.
    pub fn requires_channel(self) -> bool {
        matches!(
            self,
            MessageKind::Request
                | MessageKind::Publish
                | MessageKind::Subscribe
                | MessageKind::Unsubscribe
        )
    }
}

/// One protocol message.
///
/// Field order here is the order fields appear on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl Envelope {
    fn bare(kind: MessageKind) -> Self {
        Self {
            kind,
            channel: None,
            dtype: None,
            data: None,
            msg: None,
        }
    }

    pub fn request(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::bare(MessageKind::Request)
        }
    }

    pub fn publish(channel: impl Into<String>, dtype: impl Into<String>, data: Json) -> Self {
        Self {
            channel: Some(channel.into()),
            dtype: Some(dtype.into()),
            data: Some(data),
            ..Self::bare(MessageKind::Publish)
        }
    }

    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::bare(MessageKind::Subscribe)
        }
    }

    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::bare(MessageKind::Unsubscribe)
        }
    }

    pub fn response(channel: impl Into<String>, dtype: Option<String>, data: Json) -> Self {
        Self {
            channel: Some(channel.into()),
            dtype,
            data: Some(data),
            ..Self::bare(MessageKind::Response)
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            msg: Some(msg.into()),
            ..Self::bare(MessageKind::Error)
        }
    }

    /// Builder-style `dtype` setter.
    /// The channel, for kinds that are guaranteed to carry one after
    /// [`Envelope::decode`].
    pub fn channel(&self) -> &str {
        self.channel.as_deref().unwrap_or_default()
    }

    /// Serialise to one JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Encode`] if serialisation fails.
    pub fn encode(&self) -> Result<String, BridgeError> {
        serde_json::to_string(self).map_err(|e| BridgeError::Encode(e.to_string()))
    }

    /// Parse and validate one JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ProtocolParse`] when the frame is not valid
    /// JSON, has no (or an unknown) `type`, lacks a `channel` required by its
    /// kind, or is a publish without both `data` and `dtype`.
    pub fn decode(text: &str) -> Result<Self, BridgeError> {
        let json: Json = serde_json::from_str(text)
            .map_err(|_| BridgeError::parse(format!("Message is not valid JSON: \"{text}\"")))?;
        let Json::Object(mut obj) = json else {
            return Err(BridgeError::parse(format!(
                "Message is not a JSON object: \"{text}\""
            )));
        };

        let kind = match obj.get("type") {
            None => {
                return Err(BridgeError::parse(
                    "JSON message does not have a type attribute.",
                ));
            }
            Some(Json::String(tag)) => MessageKind::from_tag(tag).ok_or_else(|| {
                BridgeError::parse(format!("Invalid message type: \"{tag}\""))
            })?,
            Some(other) => {
                return Err(BridgeError::parse(format!("Invalid message type: {other}")));
            }
        };

        let channel = match obj.remove("channel") {
            None | Some(Json::Null) => None,
            Some(Json::String(ch)) => Some(ch),
            Some(other) => {
                return Err(BridgeError::parse(format!(
                    "Channel must be a string, got: {other}"
                )));
            }
        };
        if kind.requires_channel() && channel.is_none() {
            return Err(BridgeError::parse(
                "JSON message does not have a channel attribute.",
            ));
        }

        let dtype = match obj.remove("dtype") {
            None | Some(Json::Null) => None,
            Some(Json::String(dt)) => Some(dt),
            Some(other) => {
                return Err(BridgeError::parse(format!(
                    "Data type must be a string, got: {other}"
                )));
            }
        };
        let data = obj.remove("data").filter(|d| !d.is_null());
        let msg = match obj.remove("msg") {
            Some(Json::String(m)) => Some(m),
            _ => None,
        };

        if kind == MessageKind::Publish && (data.is_none() || dtype.is_none()) {
            return Err(BridgeError::parse(
                "Publish was requested but data or data type is missing.",
            ));
        }

        Ok(Self {
            kind,
            channel,
            dtype,
            data,
            msg,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_encodes_in_wire_order() {
        let env = Envelope::response(
            "ODOM",
            Some("pose2D".to_string()),
            json!({"x": 1.0, "y": 2.0, "theta": 0.5}),
        );
        assert_eq!(
            env.encode().unwrap(),
            r#"{"type":"response","channel":"ODOM","dtype":"pose2D","data":{"x":1.0,"y":2.0,"theta":0.5}}"#
        );
    }

    #[test]
    fn error_encodes_only_msg() {
        let env = Envelope::error("No channel: FOO");
        assert_eq!(env.encode().unwrap(), r#"{"type":"error","msg":"No channel: FOO"}"#);
    }

    #[test]
    fn decode_request() {
        let env = Envelope::decode(r#"{"type":"request","channel":"ODOM"}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Request);
        assert_eq!(env.channel(), "ODOM");
        assert!(env.data.is_none());
    }

    #[test]
    fn decode_publish() {
        let env = Envelope::decode(
            r#"{"type":"publish","channel":"CMD","dtype":"twist2D","data":{"vx":0.5,"vy":0,"wz":0}}"#,
        )
        .unwrap();
        assert_eq!(env.kind, MessageKind::Publish);
        assert_eq!(env.dtype.as_deref(), Some("twist2D"));
        assert_eq!(env.data, Some(json!({"vx": 0.5, "vy": 0, "wz": 0})));
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let err = Envelope::decode("not-json").unwrap_err();
        assert!(matches!(err, BridgeError::ProtocolParse(_)));
        assert!(err.to_string().contains("not valid JSON"));
        assert!(err.to_string().contains("not-json"));
    }

    #[test]
    fn decode_rejects_missing_type() {
        let err = Envelope::decode(r#"{"channel":"ODOM"}"#).unwrap_err();
        assert!(err.to_string().contains("type attribute"));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = Envelope::decode(r#"{"type":"explode","channel":"ODOM"}"#).unwrap_err();
        assert!(err.to_string().contains("explode"));
    }

    #[test]
    fn decode_requires_channel_for_channel_kinds() {
        for kind in ["request", "publish", "subscribe", "unsubscribe"] {
            let text = format!(r#"{{"type":"{kind}","dtype":"pose2D","data":{{}}}}"#);
            let err = Envelope::decode(&text).unwrap_err();
            assert!(err.to_string().contains("channel attribute"), "{kind}: {err}");
        }
    }

    #[test]
    fn init_needs_no_channel() {
        let env = Envelope::decode(r#"{"type":"init"}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Init);
        assert!(env.channel.is_none());
    }

    #[test]
    fn publish_requires_data_and_dtype() {
        let missing_dtype = r#"{"type":"publish","channel":"CMD","data":{"vx":1}}"#;
        let null_data = r#"{"type":"publish","channel":"CMD","dtype":"twist2D","data":null}"#;
        for text in [missing_dtype, null_data] {
            let err = Envelope::decode(text).unwrap_err();
            assert!(err.to_string().contains("data or data type is missing"));
        }
    }

    #[test]
    fn non_string_channel_is_rejected() {
        let err = Envelope::decode(r#"{"type":"request","channel":5}"#).unwrap_err();
        assert!(matches!(err, BridgeError::ProtocolParse(_)));
    }
}
