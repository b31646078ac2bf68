//! The client state machine.
//!
//! Lifecycle: `new` -> `start` (receive loop running) -> `register` (hub
//! session open) -> ... -> `unregister` -> `stop`. Handlers may be bound at
//! any point; binding while registered re-declares the subscription table.
//!
//! Pushes are dispatched on spawned tasks so a slow handler never holds up
//! the loop. `stop` waits for in-flight handlers (up to a grace period) and
//! no handler starts after it returns.

use crate::handler::{CallHandler, CallResult, Handlers, NotificationHandler, ResponseHandler};
use futures::FutureExt;
use samphub_types::error::{HubError, HubResult};
use samphub_types::ids::{ClientId, MessageId, PrivateKey};
use samphub_types::message::{
    BroadcastReport, CallAllReport, HubPush, Message, Metadata, Registration, Response,
    SubscribedClient, META_DESCRIPTION, META_NAME,
};
use samphub_types::mtype::{MTypePattern, SubscriptionTable};
use samphub_types::proxy::{HubProxy, PushReceiver, PushSender};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// How long `stop` waits for in-flight handlers before aborting them.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Error text sent for calls the client will never get to handle.
const STOPPING: &str = "client stopping";

/// Identity a client declares on registration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Declared as `samp.name`.
    pub name: String,
    /// Declared as `samp.description.text`.
    pub description: String,
    /// Extra metadata merged into the declaration.
    pub metadata: Metadata,
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            metadata: Metadata::new(),
        }
    }

    fn declared_metadata(&self) -> Metadata {
        let mut metadata = self.metadata.clone();
        if !self.name.is_empty() {
            metadata.insert(META_NAME.into(), self.name.clone().into());
        }
        if !self.description.is_empty() {
            metadata.insert(META_DESCRIPTION.into(), self.description.clone().into());
        }
        metadata
    }
}

struct ReceiveLoop {
    inbox: PushSender,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ClientInner {
    proxy: Arc<dyn HubProxy>,
    config: ClientConfig,
    handlers: RwLock<Handlers>,
    session: RwLock<Option<Registration>>,
    receive_loop: Mutex<Option<ReceiveLoop>>,
}

/// A SAMP client bound to one hub. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(proxy: Arc<dyn HubProxy>, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                proxy,
                config,
                handlers: RwLock::new(Handlers::default()),
                session: RwLock::new(None),
                receive_loop: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Start the receive loop. Idempotent.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut slot = self
            .inner
            .receive_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        let (inbox, pushes) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(receive_loop(
            Arc::downgrade(&self.inner),
            pushes,
            shutdown_rx,
        ));
        *slot = Some(ReceiveLoop {
            inbox,
            shutdown_tx,
            task,
        });
        debug!(name = %self.inner.config.name, "Client receive loop started");
    }

    /// Stop the receive loop and wait for it to exit.
    ///
    /// Does not unregister; a registered client that stops is eventually
    /// reaped by the hub once its inbox is gone.
    pub async fn stop(&self) {
        let running = self
            .inner
            .receive_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(running) = running else { return };
        let _ = running.shutdown_tx.send(true);
        drop(running.inbox);
        let _ = running.task.await;
        debug!(name = %self.inner.config.name, "Client receive loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .receive_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn is_registered(&self) -> bool {
        self.inner
            .session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.session().map(|s| s.client_id)
    }

    pub fn private_key(&self) -> Option<PrivateKey> {
        self.session().map(|s| s.private_key)
    }

    fn session(&self) -> Option<Registration> {
        self.inner
            .session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn key(&self) -> HubResult<PrivateKey> {
        self.private_key()
            .ok_or_else(|| HubError::Auth("client is not registered".to_string()))
    }

    /// Register with the hub, then declare metadata and bound subscriptions.
    pub async fn register(&self) -> HubResult<ClientId> {
        if self.is_registered() {
            return Err(HubError::Protocol("client is already registered".to_string()));
        }
        let inbox = self
            .inner
            .receive_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|l| l.inbox.clone())
            .ok_or_else(|| {
                HubError::Protocol("client must be started before registering".to_string())
            })?;

        let registration = self.inner.proxy.register(inbox).await?;
        let key = registration.private_key.clone();
        let client_id = registration.client_id.clone();
        *self
            .inner
            .session
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(registration);
        info!(client = %client_id, name = %self.inner.config.name, "Registered with hub");

        self.inner
            .proxy
            .declare_metadata(&key, self.inner.config.declared_metadata())
            .await?;
        let subscriptions = self.subscriptions();
        if !subscriptions.is_empty() {
            self.inner
                .proxy
                .declare_subscriptions(&key, subscriptions)
                .await?;
        }
        Ok(client_id)
    }

    /// Unregister from the hub. Fails with `Auth` if not registered.
    pub async fn unregister(&self) -> HubResult<()> {
        let session = self
            .inner
            .session
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| HubError::Auth("client is not registered".to_string()))?;
        match self.inner.proxy.unregister(&session.private_key).await {
            Ok(()) => {
                info!(client = %session.client_id, "Unregistered from hub");
                Ok(())
            }
            // The hub no longer knows the key, so there is no session to keep.
            Err(e @ HubError::Auth(_)) => Err(e),
            Err(e) => {
                warn!(client = %session.client_id, error = %e, "Unregister failed, keeping session");
                self.inner
                    .session
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .get_or_insert(session);
                Err(e)
            }
        }
    }

    /// The subscription table implied by the bound handlers.
    pub fn subscriptions(&self) -> SubscriptionTable {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .subscriptions()
    }

    /// Bind a notification handler, replacing any bound to the same pattern.
    pub async fn bind_receive_notification<H: NotificationHandler>(
        &self,
        pattern: &str,
        handler: H,
    ) -> HubResult<()> {
        let pattern = MTypePattern::parse(pattern)?;
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .notifications
            .bind(pattern, Arc::new(handler));
        self.redeclare_subscriptions().await
    }

    /// Bind a call handler, replacing any bound to the same pattern.
    pub async fn bind_receive_call<H: CallHandler>(
        &self,
        pattern: &str,
        handler: H,
    ) -> HubResult<()> {
        let pattern = MTypePattern::parse(pattern)?;
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .calls
            .bind(pattern, Arc::new(handler));
        self.redeclare_subscriptions().await
    }

    /// Bind the handler for responses to calls issued with `tag`.
    pub fn bind_receive_response<H: ResponseHandler>(&self, tag: &str, handler: H) -> HubResult<()> {
        if tag.trim().is_empty() {
            return Err(HubError::Protocol("response tag must not be empty".to_string()));
        }
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .responses
            .insert(tag.to_string(), Arc::new(handler));
        Ok(())
    }

    async fn redeclare_subscriptions(&self) -> HubResult<()> {
        let Some(key) = self.private_key() else {
            return Ok(());
        };
        self.inner
            .proxy
            .declare_subscriptions(&key, self.subscriptions())
            .await
    }

    pub async fn declare_metadata(&self, metadata: Metadata) -> HubResult<()> {
        self.inner.proxy.declare_metadata(&self.key()?, metadata).await
    }

    pub async fn get_metadata(&self, client: &ClientId) -> HubResult<Metadata> {
        self.inner.proxy.get_metadata(&self.key()?, client).await
    }

    pub async fn get_subscriptions(&self, client: &ClientId) -> HubResult<SubscriptionTable> {
        self.inner.proxy.get_subscriptions(&self.key()?, client).await
    }

    pub async fn get_registered_clients(&self) -> HubResult<Vec<ClientId>> {
        self.inner.proxy.get_registered_clients(&self.key()?).await
    }

    pub async fn get_subscribed_clients(&self, mtype: &str) -> HubResult<Vec<SubscribedClient>> {
        self.inner
            .proxy
            .get_subscribed_clients(&self.key()?, mtype)
            .await
    }

    pub async fn notify(&self, recipient: &ClientId, message: Message) -> HubResult<()> {
        self.inner
            .proxy
            .notify(&self.key()?, recipient, message)
            .await
    }

    pub async fn notify_all(&self, message: Message) -> HubResult<BroadcastReport> {
        self.inner.proxy.notify_all(&self.key()?, message).await
    }

    pub async fn call(
        &self,
        recipient: &ClientId,
        tag: &str,
        message: Message,
    ) -> HubResult<MessageId> {
        self.inner
            .proxy
            .call(&self.key()?, recipient, tag, message)
            .await
    }

    pub async fn call_all(&self, tag: &str, message: Message) -> HubResult<CallAllReport> {
        self.inner.proxy.call_all(&self.key()?, tag, message).await
    }

    /// Synchronous call. `None` waits until the recipient replies or leaves.
    pub async fn call_and_wait(
        &self,
        recipient: &ClientId,
        message: Message,
        timeout: Option<Duration>,
    ) -> HubResult<Response> {
        self.inner
            .proxy
            .call_and_wait(&self.key()?, recipient, message, timeout)
            .await
    }

    pub async fn reply(&self, msg_id: &MessageId, response: Response) -> HubResult<()> {
        self.inner
            .proxy
            .reply(&self.key()?, msg_id, response)
            .await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.inner.config.name)
            .field("client_id", &self.client_id())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn receive_loop(
    inner: Weak<ClientInner>,
    mut pushes: PushReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut in_flight = JoinSet::new();
    // Calls whose handler has not finished yet.
    let unanswered: Arc<Mutex<HashSet<MessageId>>> = Arc::default();
    loop {
        tokio::select! {
            push = pushes.recv() => {
                let Some(push) = push else { break };
                let Some(inner) = inner.upgrade() else { break };
                let client = Client { inner };
                let call_id = match &push {
                    HubPush::Call { msg_id, .. } => Some(msg_id.clone()),
                    _ => None,
                };
                let Some(msg_id) = call_id else {
                    in_flight.spawn(dispatch(client, push));
                    continue;
                };
                unanswered
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(msg_id.clone());
                let unanswered = Arc::clone(&unanswered);
                in_flight.spawn(async move {
                    dispatch(client, push).await;
                    unanswered
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&msg_id);
                });
            }
            Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = done {
                    warn!(error = %e, "Handler task failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let drained = tokio::time::timeout(STOP_GRACE, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(pending = in_flight.len(), "Handlers still running at stop, aborting");
        in_flight.shutdown().await;
    }

    // Answer aborted calls and calls still queued so their callers are not left waiting.
    pushes.close();
    let mut stranded: Vec<MessageId> = unanswered
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain()
        .collect();
    while let Ok(push) = pushes.try_recv() {
        if let HubPush::Call { msg_id, .. } = push {
            stranded.push(msg_id);
        }
    }
    if stranded.is_empty() {
        return;
    }
    let Some(inner) = inner.upgrade() else { return };
    let client = Client { inner };
    for msg_id in stranded {
        if let Err(e) = client.reply(&msg_id, Response::error(STOPPING)).await {
            debug!(msg_id = %msg_id, error = %e, "Could not refuse call at stop");
        }
    }
}

async fn dispatch(client: Client, push: HubPush) {
    match push {
        HubPush::Notification { sender, message } => {
            let handler = client
                .inner
                .handlers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .notifications
                .resolve(&message.mtype)
                .map(|(_, h)| h);
            match handler {
                Some(handler) => handler.on_notification(sender, message).await,
                None => debug!(mtype = %message.mtype, "No notification handler bound"),
            }
        }
        HubPush::Call {
            sender,
            msg_id,
            message,
        } => {
            let handler = client
                .inner
                .handlers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .calls
                .resolve(&message.mtype)
                .map(|(_, h)| h);
            let mtype = message.mtype.clone();
            let outcome: CallResult = match handler {
                Some(handler) => {
                    match AssertUnwindSafe(handler.on_call(sender, msg_id.clone(), message))
                        .catch_unwind()
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => Err(format!("handler for {mtype} panicked")),
                    }
                }
                None => Err(format!("no call handler bound for {mtype}")),
            };
            let response = match outcome {
                Ok(Some(result)) => Response::ok(result),
                Ok(None) => return,
                Err(text) => {
                    warn!(msg_id = %msg_id, mtype = %mtype, error = %text, "Call handler failed");
                    Response::error(text)
                }
            };
            if let Err(e) = client.reply(&msg_id, response).await {
                warn!(msg_id = %msg_id, error = %e, "Reply failed");
            }
        }
        HubPush::Response {
            responder,
            tag,
            msg_id,
            response,
        } => {
            let handler = client
                .inner
                .handlers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .responses
                .get(&tag)
                .cloned();
            match handler {
                Some(handler) => handler.on_response(responder, tag, response).await,
                None => warn!(tag = %tag, msg_id = %msg_id, "No response handler bound for tag"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Records what reaches the hub and lets tests inject pushes.
    #[derive(Default)]
    struct FakeHub {
        inbox: Mutex<Option<PushSender>>,
        declared: Mutex<Vec<SubscriptionTable>>,
        metadata: Mutex<Option<Metadata>>,
        replies: Mutex<Vec<(MessageId, Response)>>,
        unregistered: AtomicUsize,
        unregister_fails: AtomicBool,
    }

    impl FakeHub {
        fn push(&self, push: HubPush) {
            let inbox = self.inbox.lock().unwrap();
            inbox.as_ref().unwrap().send(push).unwrap();
        }

        async fn wait_replies(&self, n: usize) -> Vec<(MessageId, Response)> {
            for _ in 0..200 {
                let replies = self.replies.lock().unwrap().clone();
                if replies.len() >= n {
                    return replies;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("Expected {n} replies");
        }
    }

    #[async_trait]
    impl HubProxy for FakeHub {
        async fn register(&self, inbox: PushSender) -> HubResult<Registration> {
            *self.inbox.lock().unwrap() = Some(inbox);
            Ok(Registration {
                client_id: ClientId::from("cli#1"),
                private_key: PrivateKey::from("secret"),
                hub_id: ClientId::hub(),
            })
        }
        async fn unregister(&self, _key: &PrivateKey) -> HubResult<()> {
            if self.unregister_fails.load(Ordering::SeqCst) {
                return Err(HubError::Transport("connection reset".to_string()));
            }
            self.unregistered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn declare_metadata(&self, _key: &PrivateKey, metadata: Metadata) -> HubResult<()> {
            *self.metadata.lock().unwrap() = Some(metadata);
            Ok(())
        }
        async fn get_metadata(&self, _key: &PrivateKey, _c: &ClientId) -> HubResult<Metadata> {
            Ok(Metadata::new())
        }
        async fn declare_subscriptions(
            &self,
            _key: &PrivateKey,
            subscriptions: SubscriptionTable,
        ) -> HubResult<()> {
            self.declared.lock().unwrap().push(subscriptions);
            Ok(())
        }
        async fn get_subscriptions(
            &self,
            _key: &PrivateKey,
            _c: &ClientId,
        ) -> HubResult<SubscriptionTable> {
            Ok(SubscriptionTable::new())
        }
        async fn get_registered_clients(&self, _key: &PrivateKey) -> HubResult<Vec<ClientId>> {
            Ok(Vec::new())
        }
        async fn get_subscribed_clients(
            &self,
            _key: &PrivateKey,
            _mtype: &str,
        ) -> HubResult<Vec<SubscribedClient>> {
            Ok(Vec::new())
        }
        async fn notify(&self, _k: &PrivateKey, _r: &ClientId, _m: Message) -> HubResult<()> {
            Ok(())
        }
        async fn notify_all(&self, _k: &PrivateKey, _m: Message) -> HubResult<BroadcastReport> {
            Ok(BroadcastReport::default())
        }
        async fn call(
            &self,
            _k: &PrivateKey,
            _r: &ClientId,
            _tag: &str,
            _m: Message,
        ) -> HubResult<MessageId> {
            Ok(MessageId::from("msg-1"))
        }
        async fn call_all(&self, _k: &PrivateKey, _t: &str, _m: Message) -> HubResult<CallAllReport> {
            Ok(CallAllReport::default())
        }
        async fn call_and_wait(
            &self,
            _k: &PrivateKey,
            _r: &ClientId,
            _m: Message,
            _t: Option<Duration>,
        ) -> HubResult<Response> {
            Ok(Response::ok(Default::default()))
        }
        async fn reply(
            &self,
            _k: &PrivateKey,
            msg_id: &MessageId,
            response: Response,
        ) -> HubResult<()> {
            self.replies
                .lock()
                .unwrap()
                .push((msg_id.clone(), response));
            Ok(())
        }
    }

    fn client(hub: &Arc<FakeHub>) -> Client {
        Client::new(
            Arc::clone(hub) as Arc<dyn HubProxy>,
            ClientConfig::new("Test Client", "Client under test"),
        )
    }

    #[tokio::test]
    async fn test_register_requires_start() {
        let hub = Arc::new(FakeHub::default());
        let c = client(&hub);
        assert!(matches!(c.register().await, Err(HubError::Protocol(_))));

        c.start();
        let id = c.register().await.unwrap();
        assert_eq!(id.as_str(), "cli#1");
        assert!(c.is_registered());
        let metadata = hub.metadata.lock().unwrap().clone().unwrap();
        assert_eq!(metadata[META_NAME], "Test Client");
        c.stop().await;
    }

    #[tokio::test]
    async fn test_unregister_twice_is_auth_error() {
        let hub = Arc::new(FakeHub::default());
        let c = client(&hub);
        c.start();
        c.register().await.unwrap();
        c.unregister().await.unwrap();
        assert!(matches!(c.unregister().await, Err(HubError::Auth(_))));
        assert_eq!(hub.unregistered.load(Ordering::SeqCst), 1);
        c.stop().await;
    }

    #[tokio::test]
    async fn test_failed_unregister_keeps_session() {
        let hub = Arc::new(FakeHub::default());
        let c = client(&hub);
        c.start();
        c.register().await.unwrap();

        hub.unregister_fails.store(true, Ordering::SeqCst);
        assert!(matches!(c.unregister().await, Err(HubError::Transport(_))));
        assert!(c.is_registered());
        assert_eq!(c.private_key().unwrap().as_str(), "secret");

        hub.unregister_fails.store(false, Ordering::SeqCst);
        c.unregister().await.unwrap();
        assert!(!c.is_registered());
        c.stop().await;
    }

    #[tokio::test]
    async fn test_bind_validates_pattern() {
        let hub = Arc::new(FakeHub::default());
        let c = client(&hub);
        let err = c
            .bind_receive_notification("samp..bad", |_: ClientId, _: Message| async {})
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Protocol(_)));
        assert!(c
            .bind_receive_response("", |_: ClientId, _: String, _: Response| async {})
            .is_err());
    }

    #[tokio::test]
    async fn test_subscriptions_declared_on_register_and_sync() {
        let hub = Arc::new(FakeHub::default());
        let c = client(&hub);
        c.bind_receive_call("samp.app.*", |_: ClientId, _: MessageId, _: Message| async {
            CallResult::Ok(None)
        })
        .await
        .unwrap();
        c.start();
        c.register().await.unwrap();
        c.bind_receive_notification("samp.hub.event.*", |_: ClientId, _: Message| async {})
            .await
            .unwrap();

        let declared = hub.declared.lock().unwrap().clone();
        assert_eq!(declared.len(), 2);
        assert_eq!(declared[0].len(), 1);
        assert_eq!(declared[1].len(), 2);
        c.stop().await;
    }

    #[tokio::test]
    async fn test_call_handler_result_is_replied() {
        let hub = Arc::new(FakeHub::default());
        let c = client(&hub);
        c.bind_receive_call(
            "samp.app.echo",
            |_: ClientId, _: MessageId, message: Message| async move {
                let mut result = serde_json::Map::new();
                result.insert("txt".into(), message.params["txt"].clone());
                CallResult::Ok(Some(result))
            },
        )
        .await
        .unwrap();
        c.start();
        c.register().await.unwrap();

        hub.push(HubPush::Call {
            sender: ClientId::from("cli#2"),
            msg_id: MessageId::from("msg-7"),
            message: Message::new("samp.app.echo").with_param("txt", "hi"),
        });
        let replies = hub.wait_replies(1).await;
        assert_eq!(replies[0].0.as_str(), "msg-7");
        assert!(replies[0].1.is_ok());
        assert_eq!(replies[0].1.result.as_ref().unwrap()["txt"], "hi");
        c.stop().await;
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_reply_error() {
        let hub = Arc::new(FakeHub::default());
        let c = client(&hub);
        c.bind_receive_call("samp.fail", |_: ClientId, _: MessageId, _: Message| async {
            CallResult::Err("refused".to_string())
        })
        .await
        .unwrap();
        c.bind_receive_call("samp.panic", |_: ClientId, _: MessageId, _: Message| async {
            if true {
                panic!("handler blew up");
            }
            CallResult::Ok(None)
        })
        .await
        .unwrap();
        c.start();
        c.register().await.unwrap();

        for (id, mtype) in [("msg-1", "samp.fail"), ("msg-2", "samp.panic"), ("msg-3", "samp.none")] {
            hub.push(HubPush::Call {
                sender: ClientId::from("cli#2"),
                msg_id: MessageId::from(id),
                message: Message::new(mtype),
            });
        }
        let replies = hub.wait_replies(3).await;
        assert!(replies.iter().all(|(_, r)| !r.is_ok()));
        c.stop().await;
    }

    #[tokio::test]
    async fn test_response_routed_by_tag() {
        let hub = Arc::new(FakeHub::default());
        let c = client(&hub);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        c.bind_receive_response("print", move |_: ClientId, tag: String, r: Response| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send((tag, r.status));
            }
        })
        .unwrap();
        c.start();
        c.register().await.unwrap();

        hub.push(HubPush::Response {
            responder: ClientId::from("cli#2"),
            tag: "print".into(),
            msg_id: MessageId::from("msg-3"),
            response: Response::ok(Default::default()),
        });
        let (tag, status) = seen_rx.recv().await.unwrap();
        assert_eq!(tag, "print");
        assert_eq!(status, samphub_types::message::Status::Ok);
        c.stop().await;
    }

    #[tokio::test]
    async fn test_no_handler_runs_after_stop() {
        let hub = Arc::new(FakeHub::default());
        let c = client(&hub);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        c.bind_receive_notification("samp.*", move |_: ClientId, _: Message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();
        c.start();
        c.register().await.unwrap();
        c.stop().await;
        assert!(!c.is_running());

        let inbox = hub.inbox.lock().unwrap().clone().unwrap();
        assert!(inbox
            .send(HubPush::Notification {
                sender: ClientId::from("cli#2"),
                message: Message::new("samp.test"),
            })
            .is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_refuses_stuck_calls() {
        let hub = Arc::new(FakeHub::default());
        let c = client(&hub);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        c.bind_receive_call("samp.app.stuck", move |_: ClientId, _: MessageId, _: Message| {
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                std::future::pending::<CallResult>().await
            }
        })
        .await
        .unwrap();
        c.start();
        c.register().await.unwrap();

        hub.push(HubPush::Call {
            sender: ClientId::from("cli#2"),
            msg_id: MessageId::from("msg-9"),
            message: Message::new("samp.app.stuck"),
        });
        started_rx.recv().await.unwrap();

        // Handler never finishes; stop gives up after the grace period.
        c.stop().await;
        let replies = hub.replies.lock().unwrap().clone();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0.as_str(), "msg-9");
        assert!(!replies[0].1.is_ok());
        assert_eq!(replies[0].1.errortxt(), Some(STOPPING));
    }
}
