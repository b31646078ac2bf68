//! RemoteHub — [`HubProxy`] over a TCP connection to a [`crate::HubNode`].
//!
//! Requests are correlated with responses by a UUID. Pushes are routed to the
//! inbox each client handed to `register`.

use crate::message::*;
use crate::node::{read_message, write_message, WireError, MAX_MESSAGE_SIZE};
use async_trait::async_trait;
use dashmap::DashMap;
use samphub_types::error::{HubError, HubResult};
use samphub_types::ids::{ClientId, MessageId, PrivateKey};
use samphub_types::message::{
    BroadcastReport, CallAllReport, Message, Metadata, Registration, Response, SubscribedClient,
};
use samphub_types::mtype::SubscriptionTable;
use samphub_types::proxy::{format_timeout, HubProxy, PushSender};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Pending = DashMap<String, oneshot::Sender<WireResponse>>;

/// A connection to a remote hub.
pub struct RemoteHub {
    addr: SocketAddr,
    outbox: mpsc::UnboundedSender<WireMessage>,
    pending: Arc<Pending>,
    inboxes: Arc<DashMap<ClientId, PushSender>>,
    keys: DashMap<PrivateKey, ClientId>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RemoteHub {
    pub async fn connect(addr: SocketAddr) -> Result<Arc<Self>, WireError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();
        info!(hub = %addr, "Connected to hub");

        let (outbox, mut queue) = mpsc::unbounded_channel::<WireMessage>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = queue.recv().await {
                if let Err(e) = write_message(&mut write_half, &msg).await {
                    warn!(error = %e, "Write to hub failed");
                    break;
                }
            }
        });

        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let inboxes: Arc<DashMap<ClientId, PushSender>> = Arc::new(DashMap::new());
        let reader = {
            let pending = Arc::clone(&pending);
            let inboxes = Arc::clone(&inboxes);
            tokio::spawn(async move {
                loop {
                    let msg = match read_message(&mut read_half, MAX_MESSAGE_SIZE).await {
                        Ok(msg) => msg,
                        Err(WireError::ConnectionClosed) => {
                            info!(hub = %addr, "Hub closed the connection");
                            break;
                        }
                        Err(e) => {
                            warn!(hub = %addr, error = %e, "Read from hub failed");
                            break;
                        }
                    };
                    match msg.kind {
                        WireMessageKind::Response(response) => {
                            match pending.remove(&msg.id) {
                                Some((_, tx)) => {
                                    let _ = tx.send(response);
                                }
                                None => debug!(id = %msg.id, "Response for unknown request"),
                            }
                        }
                        WireMessageKind::Push(WirePush { recipient, push }) => {
                            let delivered = inboxes
                                .get(&recipient)
                                .map(|inbox| inbox.send(push).is_ok())
                                .unwrap_or(false);
                            if !delivered {
                                debug!(client = %recipient, "No local inbox for push, dropped");
                            }
                        }
                        WireMessageKind::Request(request) => {
                            warn!(method = request.method(), "Unexpected request from hub");
                        }
                    }
                }
                // Fail outstanding requests and close every inbox.
                pending.clear();
                inboxes.clear();
            })
        };

        Ok(Arc::new(Self {
            addr,
            outbox,
            pending,
            inboxes,
            keys: DashMap::new(),
            reader,
            writer,
        }))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Liveness probe; returns the hub's uptime.
    pub async fn ping(&self) -> HubResult<Duration> {
        #[derive(serde::Deserialize)]
        struct Pong {
            uptime_secs: u64,
        }
        let pong: Pong = self.request(HubRequest::Ping).await?;
        Ok(Duration::from_secs(pong.uptime_secs))
    }

    async fn request<T: DeserializeOwned>(&self, request: HubRequest) -> HubResult<T> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let msg = WireMessage {
            id: id.clone(),
            kind: WireMessageKind::Request(request),
        };
        if self.outbox.send(msg).is_err() {
            self.pending.remove(&id);
            return Err(HubError::Transport("connection to hub closed".to_string()));
        }

        match rx.await {
            Ok(WireResponse::Ok { result }) => serde_json::from_value(result)
                .map_err(|e| HubError::Protocol(format!("malformed hub response: {e}"))),
            Ok(WireResponse::Error { code, message }) => Err(HubError::from_code(code, message)),
            Err(_) => Err(HubError::Transport(
                "connection to hub lost before response".to_string(),
            )),
        }
    }
}

impl Drop for RemoteHub {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[async_trait]
impl HubProxy for RemoteHub {
    async fn register(&self, inbox: PushSender) -> HubResult<Registration> {
        let registration: Registration = self.request(HubRequest::Register).await?;
        self.inboxes.insert(registration.client_id.clone(), inbox);
        self.keys.insert(
            registration.private_key.clone(),
            registration.client_id.clone(),
        );
        Ok(registration)
    }

    async fn unregister(&self, key: &PrivateKey) -> HubResult<()> {
        self.request::<()>(HubRequest::Unregister { key: key.clone() })
            .await?;
        if let Some((_, client_id)) = self.keys.remove(key) {
            self.inboxes.remove(&client_id);
        }
        Ok(())
    }

    async fn declare_metadata(&self, key: &PrivateKey, metadata: Metadata) -> HubResult<()> {
        self.request(HubRequest::DeclareMetadata {
            key: key.clone(),
            metadata,
        })
        .await
    }

    async fn get_metadata(&self, key: &PrivateKey, client: &ClientId) -> HubResult<Metadata> {
        self.request(HubRequest::GetMetadata {
            key: key.clone(),
            client: client.clone(),
        })
        .await
    }

    async fn declare_subscriptions(
        &self,
        key: &PrivateKey,
        subscriptions: SubscriptionTable,
    ) -> HubResult<()> {
        self.request(HubRequest::DeclareSubscriptions {
            key: key.clone(),
            subscriptions,
        })
        .await
    }

    async fn get_subscriptions(
        &self,
        key: &PrivateKey,
        client: &ClientId,
    ) -> HubResult<SubscriptionTable> {
        self.request(HubRequest::GetSubscriptions {
            key: key.clone(),
            client: client.clone(),
        })
        .await
    }

    async fn get_registered_clients(&self, key: &PrivateKey) -> HubResult<Vec<ClientId>> {
        self.request(HubRequest::GetRegisteredClients { key: key.clone() })
            .await
    }

    async fn get_subscribed_clients(
        &self,
        key: &PrivateKey,
        mtype: &str,
    ) -> HubResult<Vec<SubscribedClient>> {
        self.request(HubRequest::GetSubscribedClients {
            key: key.clone(),
            mtype: mtype.to_string(),
        })
        .await
    }

    async fn notify(
        &self,
        key: &PrivateKey,
        recipient: &ClientId,
        message: Message,
    ) -> HubResult<()> {
        self.request(HubRequest::Notify {
            key: key.clone(),
            recipient: recipient.clone(),
            message,
        })
        .await
    }

    async fn notify_all(&self, key: &PrivateKey, message: Message) -> HubResult<BroadcastReport> {
        self.request(HubRequest::NotifyAll {
            key: key.clone(),
            message,
        })
        .await
    }

    async fn call(
        &self,
        key: &PrivateKey,
        recipient: &ClientId,
        tag: &str,
        message: Message,
    ) -> HubResult<MessageId> {
        self.request(HubRequest::Call {
            key: key.clone(),
            recipient: recipient.clone(),
            tag: tag.to_string(),
            message,
        })
        .await
    }

    async fn call_all(
        &self,
        key: &PrivateKey,
        tag: &str,
        message: Message,
    ) -> HubResult<CallAllReport> {
        self.request(HubRequest::CallAll {
            key: key.clone(),
            tag: tag.to_string(),
            message,
        })
        .await
    }

    async fn call_and_wait(
        &self,
        key: &PrivateKey,
        recipient: &ClientId,
        message: Message,
        timeout: Option<Duration>,
    ) -> HubResult<Response> {
        self.request(HubRequest::CallAndWait {
            key: key.clone(),
            recipient: recipient.clone(),
            message,
            timeout: format_timeout(timeout),
        })
        .await
    }

    async fn reply(
        &self,
        key: &PrivateKey,
        msg_id: &MessageId,
        response: Response,
    ) -> HubResult<()> {
        self.request(HubRequest::Reply {
            key: key.clone(),
            msg_id: msg_id.clone(),
            response,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::HubNode;
    use samphub_kernel::Hub;
    use samphub_types::config::HubConfig;
    use samphub_types::message::HubPush;
    use samphub_types::mtype::{HandlerKind, MTypePattern};

    #[tokio::test]
    async fn test_ping() {
        let hub = Hub::start(HubConfig::default());
        let (node, _) = HubNode::start("127.0.0.1:0".parse().unwrap(), hub)
            .await
            .unwrap();
        let remote = RemoteHub::connect(node.local_addr()).await.unwrap();
        assert!(remote.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_notification_push_routed_to_inbox() {
        let hub = Hub::start(HubConfig::default());
        let (node, _) = HubNode::start("127.0.0.1:0".parse().unwrap(), hub)
            .await
            .unwrap();
        let remote = RemoteHub::connect(node.local_addr()).await.unwrap();

        // Two clients sharing one connection
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let c1 = remote.register(tx1).await.unwrap();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let c2 = remote.register(tx2).await.unwrap();

        let mut table = SubscriptionTable::new();
        table.insert(
            MTypePattern::parse("samp.app.*").unwrap(),
            HandlerKind::Notification,
        );
        remote
            .declare_subscriptions(&c1.private_key, table)
            .await
            .unwrap();
        remote
            .notify(
                &c2.private_key,
                &c1.client_id,
                Message::new("samp.app.echo").with_param("txt", "Hello"),
            )
            .await
            .unwrap();

        match rx1.recv().await {
            Some(HubPush::Notification { sender, message }) => {
                assert_eq!(sender, c2.client_id);
                assert_eq!(message.params["txt"], "Hello");
            }
            other => panic!("Expected notification, got {other:?}"),
        }

        remote.unregister(&c1.private_key).await.unwrap();
        assert_eq!(
            remote.get_registered_clients(&c2.private_key).await.unwrap(),
            Vec::<ClientId>::new()
        );
    }

    #[tokio::test]
    async fn test_hub_shutdown_fails_requests() {
        let hub = Hub::start(HubConfig::default());
        let (node, _) = HubNode::start("127.0.0.1:0".parse().unwrap(), Arc::clone(&hub))
            .await
            .unwrap();
        let remote = RemoteHub::connect(node.local_addr()).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let reg = remote.register(tx).await.unwrap();

        hub.shutdown().await;
        let err = remote.get_registered_clients(&reg.private_key).await.unwrap_err();
        assert!(matches!(err, HubError::Auth(_)));
    }
}
