//! Messages, responses and hub pushes.
//!
//! Field names follow the SAMP conventions (`samp.mtype`, `samp.params`,
//! `samp.status`, ...) so serialized payloads look the same as the ones
//! exchanged by other SAMP implementations.

use crate::ids::{ClientId, MessageId, PrivateKey};
use crate::mtype::{HandlerKind, MTypePattern};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Client metadata: an opaque key/value map owned by one client.
pub type Metadata = Map<String, Value>;

/// Metadata key for a client's display name.
pub const META_NAME: &str = "samp.name";
/// Metadata key for a client's short description.
pub const META_DESCRIPTION: &str = "samp.description.text";

/// A message sent through the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "samp.mtype")]
    pub mtype: String,
    #[serde(rename = "samp.params", default)]
    pub params: Map<String, Value>,
}

impl Message {
    pub fn new(mtype: impl Into<String>) -> Self {
        Self {
            mtype: mtype.into(),
            params: Map::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

/// Outcome class carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "samp.ok")]
    Ok,
    /// Partial success.
    #[serde(rename = "samp.warning")]
    Warning,
    #[serde(rename = "samp.error")]
    Error,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "samp.ok"),
            Self::Warning => write!(f, "samp.warning"),
            Self::Error => write!(f, "samp.error"),
        }
    }
}

/// Error details attached to a WARNING or ERROR response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "samp.errortxt")]
    pub errortxt: String,
}

/// The reply to a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "samp.status")]
    pub status: Status,
    #[serde(rename = "samp.result", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    #[serde(rename = "samp.error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Response {
    pub fn ok(result: Map<String, Value>) -> Self {
        Self {
            status: Status::Ok,
            result: Some(result),
            error: None,
        }
    }

    pub fn warning(result: Map<String, Value>, errortxt: impl Into<String>) -> Self {
        Self {
            status: Status::Warning,
            result: Some(result),
            error: Some(ErrorInfo {
                errortxt: errortxt.into(),
            }),
        }
    }

    pub fn error(errortxt: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            result: None,
            error: Some(ErrorInfo {
                errortxt: errortxt.into(),
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn errortxt(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.errortxt.as_str())
    }
}

/// A message pushed by the hub to one registered client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "push", rename_all = "snake_case")]
pub enum HubPush {
    /// Fire-and-forget message.
    Notification { sender: ClientId, message: Message },
    /// A call the recipient must answer with `reply(msg_id, ...)`.
    Call {
        sender: ClientId,
        msg_id: MessageId,
        message: Message,
    },
    /// The resolution of an asynchronous call this client issued under `tag`.
    Response {
        responder: ClientId,
        tag: String,
        msg_id: MessageId,
        response: Response,
    },
}

impl HubPush {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Notification { .. } => "notification",
            Self::Call { .. } => "call",
            Self::Response { .. } => "response",
        }
    }
}

/// Credentials handed out by `register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub client_id: ClientId,
    pub private_key: PrivateKey,
    pub hub_id: ClientId,
}

/// A per-recipient delivery failure inside a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub client_id: ClientId,
    pub error: String,
}

/// Result of `notify_all`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReport {
    /// Recipients notified, in registration order.
    pub delivered: Vec<ClientId>,
    pub failed: Vec<DeliveryFailure>,
}

impl BroadcastReport {
    /// OK when every delivery succeeded, WARNING otherwise.
    pub fn status(&self) -> Status {
        if self.failed.is_empty() {
            Status::Ok
        } else {
            Status::Warning
        }
    }
}

/// One call issued by `call_all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCall {
    pub recipient: ClientId,
    pub msg_id: MessageId,
}

/// Result of `call_all`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAllReport {
    /// Issued calls, in registration order of the recipients.
    pub calls: Vec<IssuedCall>,
    pub failed: Vec<DeliveryFailure>,
}

impl CallAllReport {
    /// The message id of the call sent to `recipient`.
    pub fn msg_id_for(&self, recipient: &ClientId) -> Option<&MessageId> {
        self.calls
            .iter()
            .find(|c| &c.recipient == recipient)
            .map(|c| &c.msg_id)
    }

    pub fn status(&self) -> Status {
        if self.failed.is_empty() {
            Status::Ok
        } else {
            Status::Warning
        }
    }
}

/// A client subscribed to a given MType, as reported by `get_subscribed_clients`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribedClient {
    pub client_id: ClientId,
    pub pattern: MTypePattern,
    pub kind: HandlerKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_uses_samp_field_names() {
        let msg = Message::new("samp.app.echo").with_param("txt", "Hello world!");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["samp.mtype"], "samp.app.echo");
        assert_eq!(json["samp.params"]["txt"], "Hello world!");
    }

    #[test]
    fn test_message_params_default_to_empty() {
        let msg: Message = serde_json::from_value(json!({"samp.mtype": "samp.test"})).unwrap();
        assert!(msg.params.is_empty());
    }

    #[test]
    fn test_response_shapes() {
        let mut result = Map::new();
        result.insert("txt".into(), json!("printed"));
        let ok = serde_json::to_value(Response::ok(result)).unwrap();
        assert_eq!(ok["samp.status"], "samp.ok");
        assert_eq!(ok["samp.result"]["txt"], "printed");
        assert!(ok.get("samp.error").is_none());

        let err = Response::error("handler failed");
        assert!(!err.is_ok());
        assert_eq!(err.errortxt(), Some("handler failed"));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["samp.status"], "samp.error");
        assert_eq!(json["samp.error"]["samp.errortxt"], "handler failed");
    }

    #[test]
    fn test_push_tagging() {
        let push = HubPush::Call {
            sender: ClientId::from_sequence(2),
            msg_id: MessageId::from_sequence(1),
            message: Message::new("samp.test"),
        };
        let json = serde_json::to_value(&push).unwrap();
        assert_eq!(json["push"], "call");
        assert_eq!(json["sender"], "cli#2");
        assert_eq!(push.label(), "call");
    }

    #[test]
    fn test_report_status() {
        let mut report = BroadcastReport::default();
        assert_eq!(report.status(), Status::Ok);
        report.failed.push(DeliveryFailure {
            client_id: ClientId::from_sequence(1),
            error: "closed".into(),
        });
        assert_eq!(report.status(), Status::Warning);
    }

    #[test]
    fn test_call_all_lookup() {
        let report = CallAllReport {
            calls: vec![IssuedCall {
                recipient: ClientId::from_sequence(1),
                msg_id: MessageId::from_sequence(9),
            }],
            failed: vec![],
        };
        assert_eq!(
            report.msg_id_for(&ClientId::from_sequence(1)),
            Some(&MessageId::from_sequence(9))
        );
        assert!(report.msg_id_for(&ClientId::from_sequence(2)).is_none());
    }
}
