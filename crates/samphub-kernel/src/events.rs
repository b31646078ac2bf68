//! Hub lifecycle events, broadcast as notifications from the `hub` client.

use samphub_types::ids::ClientId;
use samphub_types::message::{Message, Metadata};
use samphub_types::mtype::SubscriptionTable;
use serde_json::Value;

pub const EVENT_REGISTER: &str = "samp.hub.event.register";
pub const EVENT_UNREGISTER: &str = "samp.hub.event.unregister";
pub const EVENT_METADATA: &str = "samp.hub.event.metadata";
pub const EVENT_SUBSCRIPTIONS: &str = "samp.hub.event.subscriptions";
pub const EVENT_SHUTDOWN: &str = "samp.hub.event.shutdown";

pub fn register(client: &ClientId) -> Message {
    Message::new(EVENT_REGISTER).with_param("id", client.as_str())
}

pub fn unregister(client: &ClientId) -> Message {
    Message::new(EVENT_UNREGISTER).with_param("id", client.as_str())
}

pub fn metadata(client: &ClientId, metadata: &Metadata) -> Message {
    Message::new(EVENT_METADATA)
        .with_param("id", client.as_str())
        .with_param("metadata", Value::Object(metadata.clone()))
}

pub fn subscriptions(client: &ClientId, table: &SubscriptionTable) -> Message {
    Message::new(EVENT_SUBSCRIPTIONS)
        .with_param("id", client.as_str())
        .with_param(
            "subscriptions",
            serde_json::to_value(table).unwrap_or(Value::Null),
        )
}

pub fn shutdown() -> Message {
    Message::new(EVENT_SHUTDOWN)
}
