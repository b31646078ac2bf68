//! Wire protocol message types.
//!
//! A connection carries three kinds of frames: client requests, the hub's
//! responses (correlated by `id`), and pushes the hub sends unprompted to a
//! client registered over that connection.

use samphub_types::error::HubError;
use samphub_types::ids::{ClientId, MessageId, PrivateKey};
use samphub_types::message::{HubPush, Message, Metadata, Response};
use samphub_types::mtype::SubscriptionTable;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A wire protocol message (envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Request id, echoed by its response. Pushes carry a fresh id.
    pub id: String,
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessageKind {
    Request(HubRequest),
    Response(WireResponse),
    Push(WirePush),
}

/// One hub operation. Every request except `register` and `ping` carries the
/// caller's private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum HubRequest {
    /// Register a client whose pushes arrive on this connection.
    Register,
    Unregister {
        key: PrivateKey,
    },
    DeclareMetadata {
        key: PrivateKey,
        metadata: Metadata,
    },
    GetMetadata {
        key: PrivateKey,
        client: ClientId,
    },
    DeclareSubscriptions {
        key: PrivateKey,
        subscriptions: SubscriptionTable,
    },
    GetSubscriptions {
        key: PrivateKey,
        client: ClientId,
    },
    GetRegisteredClients {
        key: PrivateKey,
    },
    GetSubscribedClients {
        key: PrivateKey,
        mtype: String,
    },
    Notify {
        key: PrivateKey,
        recipient: ClientId,
        message: Message,
    },
    NotifyAll {
        key: PrivateKey,
        message: Message,
    },
    Call {
        key: PrivateKey,
        recipient: ClientId,
        tag: String,
        message: Message,
    },
    CallAll {
        key: PrivateKey,
        tag: String,
        message: Message,
    },
    CallAndWait {
        key: PrivateKey,
        recipient: ClientId,
        message: Message,
        /// Seconds as a decimal string; `"0"` waits indefinitely.
        #[serde(default)]
        timeout: String,
    },
    Reply {
        key: PrivateKey,
        msg_id: MessageId,
        response: Response,
    },
    /// Liveness probe; answered with the hub's uptime.
    Ping,
}

impl HubRequest {
    /// Method name, for logs.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Unregister { .. } => "unregister",
            Self::DeclareMetadata { .. } => "declare_metadata",
            Self::GetMetadata { .. } => "get_metadata",
            Self::DeclareSubscriptions { .. } => "declare_subscriptions",
            Self::GetSubscriptions { .. } => "get_subscriptions",
            Self::GetRegisteredClients { .. } => "get_registered_clients",
            Self::GetSubscribedClients { .. } => "get_subscribed_clients",
            Self::Notify { .. } => "notify",
            Self::NotifyAll { .. } => "notify_all",
            Self::Call { .. } => "call",
            Self::CallAll { .. } => "call_all",
            Self::CallAndWait { .. } => "call_and_wait",
            Self::Reply { .. } => "reply",
            Self::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WireResponse {
    Ok {
        #[serde(default)]
        result: Value,
    },
    /// `code` is [`HubError::code`]; the client rebuilds the error from it.
    Error { code: i32, message: String },
}

impl From<HubError> for WireResponse {
    fn from(err: HubError) -> Self {
        Self::Error {
            code: err.code(),
            message: err.detail(),
        }
    }
}

/// A push addressed to one client registered over the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePush {
    pub recipient: ClientId,
    pub push: HubPush,
}

/// Encode a wire message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&(json.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}
