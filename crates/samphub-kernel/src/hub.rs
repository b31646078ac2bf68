//! The hub facade over registry, router and call tracker.
//!
//! [`Hub`] implements [`HubProxy`], so in-process clients talk to it
//! directly and the TCP binding forwards decoded requests to it. Dispatch
//! never waits on a recipient: pushes go into per-client queues, and a
//! `call_and_wait` only suspends the task that issued it.

use crate::events;
use crate::housekeeping::{self, HousekeepingReport};
use crate::registry::{ClientRecord, Registry};
use crate::router::Router;
use crate::tracker::{AsyncCompletion, CallState, CallTracker, Resolution};
use crate::transport::{ChannelTransport, PushTransport};
use async_trait::async_trait;
use samphub_types::config::HubConfig;
use samphub_types::error::{HubError, HubResult};
use samphub_types::ids::{ClientId, MessageId, PrivateKey};
use samphub_types::message::{
    BroadcastReport, CallAllReport, DeliveryFailure, HubPush, IssuedCall, Message, Metadata,
    Registration, Response, SubscribedClient, META_DESCRIPTION, META_NAME,
};
use samphub_types::mtype::{validate_mtype, MTypePattern, Role, SubscriptionTable};
use samphub_types::proxy::{HubProxy, PushSender};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A running message hub.
pub struct Hub {
    config: HubConfig,
    hub_id: ClientId,
    registry: Arc<Registry>,
    router: Router,
    tracker: CallTracker,
    shutdown_tx: watch::Sender<bool>,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl Hub {
    /// Create a hub without background housekeeping.
    pub fn new(config: HubConfig) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            hub_id: ClientId::hub(),
            router: Router::new(Arc::clone(&registry)),
            tracker: CallTracker::new(config.retired_history),
            registry,
            shutdown_tx,
            housekeeping: Mutex::new(None),
            started_at: Instant::now(),
            config,
        })
    }

    /// Create a hub and start its housekeeping task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: HubConfig) -> Arc<Self> {
        let hub = Self::new(config);
        let handle = housekeeping::spawn(
            Arc::downgrade(&hub),
            hub.config.housekeeping_interval(),
            hub.shutdown_tx.subscribe(),
        );
        *hub.housekeeping.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!(
            name = %hub.config.hub_name,
            interval_ms = hub.config.housekeeping_interval_ms,
            "Hub started"
        );
        hub
    }

    /// Start a hub configured from `path`, or `~/.samphub/config.toml`.
    pub fn start_from_file(path: Option<&Path>) -> Arc<Self> {
        Self::start(crate::config::load_config(path))
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn hub_id(&self) -> &ClientId {
        &self.hub_id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn tracker(&self) -> &CallTracker {
        &self.tracker
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// A receiver that flips to `true` when [`Hub::shutdown`] begins.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// The hub's own metadata, as returned for `get_metadata("hub")`.
    pub fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(META_NAME.into(), self.config.hub_name.clone().into());
        metadata.insert(
            META_DESCRIPTION.into(),
            "In-memory SAMP message hub".into(),
        );
        metadata
    }

    /// Register a client reached through `transport`.
    pub fn register_transport(&self, transport: Arc<dyn PushTransport>) -> HubResult<Registration> {
        if self.is_shutting_down() {
            return Err(HubError::Auth(
                "hub is shutting down, registration refused".to_string(),
            ));
        }
        let (client_id, private_key) = self.registry.register(transport)?;
        info!(client = %client_id, clients = self.registry.len(), "Client registered");
        self.broadcast_event(events::register(&client_id));
        Ok(Registration {
            client_id,
            private_key,
            hub_id: self.hub_id.clone(),
        })
    }

    /// Add a notification subscription for `pattern` to the caller's table.
    pub fn bind_notification(&self, key: &PrivateKey, pattern: &str) -> HubResult<()> {
        self.bind(key, pattern, Role::Notification)
    }

    /// Add a call subscription for `pattern` to the caller's table.
    pub fn bind_call(&self, key: &PrivateKey, pattern: &str) -> HubResult<()> {
        self.bind(key, pattern, Role::Call)
    }

    fn bind(&self, key: &PrivateKey, pattern: &str, role: Role) -> HubResult<()> {
        let pattern = MTypePattern::parse(pattern)?;
        let (client_id, table) = self
            .registry
            .update_subscriptions(key, |t| t.add(pattern, role.into()))?;
        self.broadcast_event(events::subscriptions(&client_id, &table));
        Ok(())
    }

    /// Run one housekeeping pass: expire overdue calls, reap dead clients.
    pub fn housekeeping_tick(&self, now: Instant) -> HousekeepingReport {
        let completions = self.tracker.sweep_timeouts(now);
        let timed_out_calls = completions.len();
        for completion in completions {
            warn!(
                msg_id = %completion.msg_id,
                caller = %completion.caller,
                recipient = %completion.responder,
                "Asynchronous call timed out"
            );
            self.push_completion(completion);
        }

        let mut reaped_clients = Vec::new();
        for client_id in self.registry.dead_clients() {
            if let Some(record) = self.registry.remove(&client_id) {
                self.retire_client(record, "liveness check failed");
                reaped_clients.push(client_id);
            }
        }

        HousekeepingReport {
            timed_out_calls,
            reaped_clients,
        }
    }

    /// Ordered teardown: refuse registrations, announce shutdown, unregister
    /// every client (cancelling their calls), then stop housekeeping.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!(clients = self.registry.len(), "Hub shutting down");
        self.registry.close();
        self.broadcast_event(events::shutdown());

        for client_id in self.registry.list_clients() {
            if let Some(record) = self.registry.remove(&client_id) {
                self.retire_client(record, "hub shutdown");
            }
        }

        let handle = self
            .housekeeping
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Hub stopped");
    }

    /// Queue a push; a failed delivery marks the recipient dead.
    fn deliver(
        &self,
        recipient: &ClientId,
        transport: &dyn PushTransport,
        push: HubPush,
    ) -> HubResult<()> {
        let label = push.label();
        transport.deliver(push).map_err(|e| {
            warn!(client = %recipient, kind = label, error = %e, "Delivery failed");
            self.registry.mark_dead(recipient);
            e
        })
    }

    fn broadcast_event(&self, message: Message) {
        let routes = match self.router.resolve_recipients(
            &self.hub_id,
            &message.mtype,
            None,
            Role::Notification,
        ) {
            Ok(routes) => routes,
            Err(e) => {
                debug!(mtype = %message.mtype, error = %e, "No event recipients");
                return;
            }
        };
        for route in routes {
            let push = HubPush::Notification {
                sender: self.hub_id.clone(),
                message: message.clone(),
            };
            let _ = self.deliver(&route.client_id, route.transport.as_ref(), push);
        }
    }

    fn push_completion(&self, completion: AsyncCompletion) {
        let Some(entry) = self.registry.entry(&completion.caller) else {
            debug!(
                msg_id = %completion.msg_id,
                caller = %completion.caller,
                "Caller gone, dropping response"
            );
            return;
        };
        let push = HubPush::Response {
            responder: completion.responder,
            tag: completion.tag,
            msg_id: completion.msg_id,
            response: completion.response,
        };
        let _ = self.deliver(&entry.client_id, entry.transport.as_ref(), push);
    }

    fn retire_client(&self, record: ClientRecord, reason: &str) {
        let client_id = record.client_id.clone();
        let cancelled = self.tracker.cancel_for_caller_gone(&client_id);
        let orphaned = self.tracker.cancel_for_recipient_gone(&client_id);
        info!(
            client = %client_id,
            reason,
            cancelled_calls = cancelled,
            orphaned_calls = orphaned.len(),
            "Client unregistered"
        );
        for completion in orphaned {
            self.push_completion(completion);
        }
        drop(record);
        self.broadcast_event(events::unregister(&client_id));
    }

    /// Check both ends of a freshly opened call are still registered.
    ///
    /// Unregistering removes the record before cancelling its calls, so a call
    /// opened after that sweep is caught here and retired.
    fn confirm_call_ends(
        &self,
        caller: &ClientId,
        recipient: &ClientId,
        msg_id: &MessageId,
    ) -> HubResult<()> {
        if !self.registry.contains(recipient) {
            self.tracker.abandon(msg_id, CallState::RecipientGone);
            return Err(HubError::RecipientGone(format!(
                "recipient {recipient} unregistered before the call was delivered"
            )));
        }
        if !self.registry.contains(caller) {
            self.tracker.abandon(msg_id, CallState::Cancelled);
            return Err(HubError::Cancelled(format!("caller {caller} unregistered")));
        }
        Ok(())
    }

    fn route_one(
        &self,
        sender: &ClientId,
        recipient: &ClientId,
        message: &Message,
        role: Role,
    ) -> HubResult<crate::router::Route> {
        validate_mtype(&message.mtype)?;
        self.router
            .resolve_recipients(sender, &message.mtype, Some(recipient), role)?
            .into_iter()
            .next()
            .ok_or_else(|| HubError::NotSubscribed(format!("client {recipient} not reachable")))
    }
}

fn validate_tag(tag: &str) -> HubResult<()> {
    if tag.trim().is_empty() {
        return Err(HubError::Protocol("message tag must not be empty".to_string()));
    }
    Ok(())
}

#[async_trait]
impl HubProxy for Hub {
    async fn register(&self, inbox: PushSender) -> HubResult<Registration> {
        self.register_transport(Arc::new(ChannelTransport::new(inbox)))
    }

    async fn unregister(&self, key: &PrivateKey) -> HubResult<()> {
        let record = self.registry.unregister(key)?;
        self.retire_client(record, "unregister");
        Ok(())
    }

    async fn declare_metadata(&self, key: &PrivateKey, metadata: Metadata) -> HubResult<()> {
        let client_id = self.registry.declare_metadata(key, metadata.clone())?;
        debug!(client = %client_id, keys = metadata.len(), "Metadata declared");
        self.broadcast_event(events::metadata(&client_id, &metadata));
        Ok(())
    }

    async fn get_metadata(&self, key: &PrivateKey, client: &ClientId) -> HubResult<Metadata> {
        self.registry.authenticate(key)?;
        if client.is_hub() {
            return Ok(self.metadata());
        }
        self.registry.metadata(client)
    }

    async fn declare_subscriptions(
        &self,
        key: &PrivateKey,
        subscriptions: SubscriptionTable,
    ) -> HubResult<()> {
        let client_id = self
            .registry
            .declare_subscriptions(key, subscriptions.clone())?;
        debug!(client = %client_id, patterns = subscriptions.len(), "Subscriptions declared");
        self.broadcast_event(events::subscriptions(&client_id, &subscriptions));
        Ok(())
    }

    async fn get_subscriptions(
        &self,
        key: &PrivateKey,
        client: &ClientId,
    ) -> HubResult<SubscriptionTable> {
        self.registry.authenticate(key)?;
        self.registry.subscriptions(client)
    }

    async fn get_registered_clients(&self, key: &PrivateKey) -> HubResult<Vec<ClientId>> {
        let caller = self.registry.authenticate(key)?;
        Ok(self
            .registry
            .list_clients()
            .into_iter()
            .filter(|id| id != &caller)
            .collect())
    }

    async fn get_subscribed_clients(
        &self,
        key: &PrivateKey,
        mtype: &str,
    ) -> HubResult<Vec<SubscribedClient>> {
        let caller = self.registry.authenticate(key)?;
        validate_mtype(mtype)?;
        Ok(self.router.subscribed_clients(&caller, mtype))
    }

    async fn notify(
        &self,
        key: &PrivateKey,
        recipient: &ClientId,
        message: Message,
    ) -> HubResult<()> {
        let sender = self.registry.authenticate(key)?;
        let route = self.route_one(&sender, recipient, &message, Role::Notification)?;
        debug!(sender = %sender, recipient = %recipient, mtype = %message.mtype, "Notify");
        self.deliver(
            &route.client_id,
            route.transport.as_ref(),
            HubPush::Notification { sender, message },
        )
    }

    async fn notify_all(&self, key: &PrivateKey, message: Message) -> HubResult<BroadcastReport> {
        let sender = self.registry.authenticate(key)?;
        validate_mtype(&message.mtype)?;
        let routes =
            self.router
                .resolve_recipients(&sender, &message.mtype, None, Role::Notification)?;

        let mut report = BroadcastReport::default();
        for route in routes {
            let push = HubPush::Notification {
                sender: sender.clone(),
                message: message.clone(),
            };
            match self.deliver(&route.client_id, route.transport.as_ref(), push) {
                Ok(()) => report.delivered.push(route.client_id),
                Err(e) => report.failed.push(DeliveryFailure {
                    client_id: route.client_id,
                    error: e.to_string(),
                }),
            }
        }
        debug!(
            sender = %sender,
            mtype = %message.mtype,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Notify all"
        );
        Ok(report)
    }

    async fn call(
        &self,
        key: &PrivateKey,
        recipient: &ClientId,
        tag: &str,
        message: Message,
    ) -> HubResult<MessageId> {
        let sender = self.registry.authenticate(key)?;
        validate_tag(tag)?;
        let route = self.route_one(&sender, recipient, &message, Role::Call)?;

        let msg_id = self.tracker.start_call(
            &sender,
            &route.client_id,
            tag,
            self.config.default_call_timeout(),
        );
        self.confirm_call_ends(&sender, &route.client_id, &msg_id)?;
        let push = HubPush::Call {
            sender: sender.clone(),
            msg_id: msg_id.clone(),
            message,
        };
        if let Err(e) = self.deliver(&route.client_id, route.transport.as_ref(), push) {
            self.tracker.abandon(&msg_id, CallState::Cancelled);
            return Err(e);
        }
        debug!(sender = %sender, recipient = %recipient, msg_id = %msg_id, tag, "Call");
        Ok(msg_id)
    }

    async fn call_all(
        &self,
        key: &PrivateKey,
        tag: &str,
        message: Message,
    ) -> HubResult<CallAllReport> {
        let sender = self.registry.authenticate(key)?;
        validate_tag(tag)?;
        validate_mtype(&message.mtype)?;
        let routes = self
            .router
            .resolve_recipients(&sender, &message.mtype, None, Role::Call)?;

        let mut report = CallAllReport::default();
        for route in routes {
            let msg_id = self.tracker.start_call(
                &sender,
                &route.client_id,
                tag,
                self.config.default_call_timeout(),
            );
            match self.confirm_call_ends(&sender, &route.client_id, &msg_id) {
                Ok(()) => {}
                Err(e @ HubError::RecipientGone(_)) => {
                    report.failed.push(DeliveryFailure {
                        client_id: route.client_id,
                        error: e.to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            }
            let push = HubPush::Call {
                sender: sender.clone(),
                msg_id: msg_id.clone(),
                message: message.clone(),
            };
            match self.deliver(&route.client_id, route.transport.as_ref(), push) {
                Ok(()) => report.calls.push(IssuedCall {
                    recipient: route.client_id,
                    msg_id,
                }),
                Err(e) => {
                    self.tracker.abandon(&msg_id, CallState::Cancelled);
                    report.failed.push(DeliveryFailure {
                        client_id: route.client_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        debug!(
            sender = %sender,
            mtype = %message.mtype,
            tag,
            calls = report.calls.len(),
            failed = report.failed.len(),
            "Call all"
        );
        Ok(report)
    }

    async fn call_and_wait(
        &self,
        key: &PrivateKey,
        recipient: &ClientId,
        message: Message,
        timeout: Option<Duration>,
    ) -> HubResult<Response> {
        let sender = self.registry.authenticate(key)?;
        let route = self.route_one(&sender, recipient, &message, Role::Call)?;

        let (msg_id, mut rx) = self.tracker.start_sync_call(&sender, &route.client_id, None);
        self.confirm_call_ends(&sender, &route.client_id, &msg_id)?;
        let push = HubPush::Call {
            sender: sender.clone(),
            msg_id: msg_id.clone(),
            message,
        };
        if let Err(e) = self.deliver(&route.client_id, route.transport.as_ref(), push) {
            self.tracker.abandon(&msg_id, CallState::Cancelled);
            return Err(e);
        }
        debug!(sender = %sender, recipient = %recipient, msg_id = %msg_id, ?timeout, "Call and wait");

        let abandoned = || HubError::Cancelled(format!("call {msg_id} abandoned by the hub"));
        match timeout.filter(|t| !t.is_zero()) {
            None => rx.await.unwrap_or_else(|_| Err(abandoned())),
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(outcome) => outcome.unwrap_or_else(|_| Err(abandoned())),
                Err(_) => {
                    if self.tracker.expire(&msg_id) {
                        warn!(msg_id = %msg_id, recipient = %recipient, "Synchronous call timed out");
                        Err(HubError::Timeout(limit))
                    } else {
                        // Resolved in the instant the timer fired.
                        rx.try_recv().unwrap_or(Err(HubError::Timeout(limit)))
                    }
                }
            },
        }
    }

    async fn reply(
        &self,
        key: &PrivateKey,
        msg_id: &MessageId,
        response: Response,
    ) -> HubResult<()> {
        let responder = self.registry.authenticate(key)?;
        match self.tracker.resolve(&responder, msg_id, response)? {
            Resolution::Respond(completion) => self.push_completion(completion),
            Resolution::Woke | Resolution::Discarded(_) => {}
        }
        Ok(())
    }
}
