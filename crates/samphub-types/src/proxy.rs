//! The client-facing hub operation set.
//!
//! [`HubProxy`] is implemented by the in-process hub and by the TCP binding,
//! so the client library works the same against either. Messages the hub
//! pushes to a client travel back over the [`PushSender`] handed to
//! [`HubProxy::register`].

use crate::error::{HubError, HubResult};
use crate::ids::{ClientId, MessageId, PrivateKey};
use crate::message::{
    BroadcastReport, CallAllReport, HubPush, Message, Metadata, Registration, Response,
    SubscribedClient,
};
use crate::mtype::SubscriptionTable;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Sending half of a client's inbox.
pub type PushSender = mpsc::UnboundedSender<HubPush>;
/// Receiving half of a client's inbox.
pub type PushReceiver = mpsc::UnboundedReceiver<HubPush>;

/// Operations a registered client can invoke on a hub.
///
/// Every operation except `register` authenticates with the caller's
/// private key and fails with [`HubError::Auth`] when it is unknown.
#[async_trait]
pub trait HubProxy: Send + Sync + 'static {
    /// Register a new client whose pushes are delivered to `inbox`.
    async fn register(&self, inbox: PushSender) -> HubResult<Registration>;

    async fn unregister(&self, key: &PrivateKey) -> HubResult<()>;

    /// Replace the caller's metadata wholesale.
    async fn declare_metadata(&self, key: &PrivateKey, metadata: Metadata) -> HubResult<()>;

    async fn get_metadata(&self, key: &PrivateKey, client: &ClientId) -> HubResult<Metadata>;

    /// Replace the caller's subscription table wholesale.
    async fn declare_subscriptions(
        &self,
        key: &PrivateKey,
        subscriptions: SubscriptionTable,
    ) -> HubResult<()>;

    async fn get_subscriptions(
        &self,
        key: &PrivateKey,
        client: &ClientId,
    ) -> HubResult<SubscriptionTable>;

    /// All other registered clients, in registration order.
    async fn get_registered_clients(&self, key: &PrivateKey) -> HubResult<Vec<ClientId>>;

    /// All other clients with a pattern matching `mtype`.
    async fn get_subscribed_clients(
        &self,
        key: &PrivateKey,
        mtype: &str,
    ) -> HubResult<Vec<SubscribedClient>>;

    async fn notify(&self, key: &PrivateKey, recipient: &ClientId, message: Message)
        -> HubResult<()>;

    async fn notify_all(&self, key: &PrivateKey, message: Message) -> HubResult<BroadcastReport>;

    /// Targeted asynchronous call; the reply arrives later as a
    /// [`HubPush::Response`] carrying `tag`.
    async fn call(
        &self,
        key: &PrivateKey,
        recipient: &ClientId,
        tag: &str,
        message: Message,
    ) -> HubResult<MessageId>;

    async fn call_all(
        &self,
        key: &PrivateKey,
        tag: &str,
        message: Message,
    ) -> HubResult<CallAllReport>;

    /// Targeted synchronous call. `None` waits indefinitely.
    async fn call_and_wait(
        &self,
        key: &PrivateKey,
        recipient: &ClientId,
        message: Message,
        timeout: Option<Duration>,
    ) -> HubResult<Response>;

    /// Answer a call previously pushed to the caller.
    async fn reply(&self, key: &PrivateKey, msg_id: &MessageId, response: Response)
        -> HubResult<()>;
}

/// Parse a SAMP-style timeout string (seconds). `""` and `"0"` mean no timeout.
pub fn parse_timeout(secs: &str) -> HubResult<Option<Duration>> {
    let secs = secs.trim();
    if secs.is_empty() {
        return Ok(None);
    }
    let value: f64 = secs
        .parse()
        .map_err(|_| HubError::Protocol(format!("invalid timeout '{secs}'")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(HubError::Protocol(format!("invalid timeout '{secs}'")));
    }
    if value == 0.0 {
        return Ok(None);
    }
    // Longer than `Duration` can hold is as good as forever.
    Ok(Some(
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX),
    ))
}

/// Inverse of [`parse_timeout`].
pub fn format_timeout(timeout: Option<Duration>) -> String {
    match timeout {
        Some(d) if !d.is_zero() => d.as_secs_f64().to_string(),
        _ => "0".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("10").unwrap(), Some(Duration::from_secs(10)));
        assert_eq!(parse_timeout("0").unwrap(), None);
        assert_eq!(parse_timeout("").unwrap(), None);
        assert_eq!(parse_timeout("0.5").unwrap(), Some(Duration::from_millis(500)));
        assert!(parse_timeout("-1").is_err());
        assert!(parse_timeout("soon").is_err());
        assert!(parse_timeout("inf").is_err());
    }

    #[test]
    fn test_parse_timeout_saturates() {
        assert_eq!(parse_timeout("1e30").unwrap(), Some(Duration::MAX));
        let text = format_timeout(Some(Duration::MAX));
        assert_eq!(parse_timeout(&text).unwrap(), Some(Duration::MAX));
    }

    #[test]
    fn test_format_timeout() {
        assert_eq!(format_timeout(None), "0");
        assert_eq!(format_timeout(Some(Duration::ZERO)), "0");
        let text = format_timeout(Some(Duration::from_millis(1500)));
        assert_eq!(parse_timeout(&text).unwrap(), Some(Duration::from_millis(1500)));
    }
}
