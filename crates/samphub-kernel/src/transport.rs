//! Hub-to-client delivery.
//!
//! The hub never talks to a client directly: each registration carries a
//! [`PushTransport`] that accepts [`HubPush`] messages for that client. Both
//! bindings use a [`ChannelTransport`]: in process it is the client's own
//! inbox, over TCP the connection relays the channel onto the socket.

use samphub_types::error::{HubError, HubResult};
use samphub_types::message::HubPush;
use samphub_types::proxy::PushSender;

/// Delivery channel to one registered client.
pub trait PushTransport: Send + Sync + 'static {
    /// Queue a push for the client. Must not block.
    fn deliver(&self, push: HubPush) -> HubResult<()>;

    /// Whether the far end is known to be gone.
    fn is_closed(&self) -> bool;
}

/// Transport backed by an in-process unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: PushSender,
}

impl ChannelTransport {
    pub fn new(tx: PushSender) -> Self {
        Self { tx }
    }
}

impl PushTransport for ChannelTransport {
    fn deliver(&self, push: HubPush) -> HubResult<()> {
        self.tx
            .send(push)
            .map_err(|_| HubError::Transport("client inbox closed".to_string()))
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use samphub_types::ids::ClientId;
    use samphub_types::message::Message;
    use tokio::sync::mpsc;

    fn push() -> HubPush {
        HubPush::Notification {
            sender: ClientId::hub(),
            message: Message::new("samp.test"),
        }
    }

    #[test]
    fn test_channel_transport_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport::new(tx);
        tokio_test::assert_ok!(transport.deliver(push()));
        assert_eq!(rx.try_recv().unwrap(), push());
        assert!(!transport.is_closed());
    }

    #[test]
    fn test_channel_transport_reports_closed_inbox() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport::new(tx);
        drop(rx);
        assert!(transport.is_closed());
        let err = tokio_test::assert_err!(transport.deliver(push()));
        assert!(matches!(err, HubError::Transport(_)));
    }
}
