//! Handler traits and the client's binding tables.
//!
//! Handlers are async traits so applications can bind either their own types
//! or plain closures returning futures.

use async_trait::async_trait;
use samphub_types::ids::{ClientId, MessageId};
use samphub_types::message::{Message, Response};
use samphub_types::mtype::{HandlerKind, MTypePattern, SubscriptionTable};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

/// What a call handler produced.
///
/// `Ok(Some(result))` is replied with OK status, `Ok(None)` means the handler
/// replies on its own later, and `Err(text)` is replied with ERROR status.
pub type CallResult = Result<Option<Map<String, Value>>, String>;

#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    async fn on_notification(&self, sender: ClientId, message: Message);
}

#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn on_call(&self, sender: ClientId, msg_id: MessageId, message: Message) -> CallResult;
}

#[async_trait]
pub trait ResponseHandler: Send + Sync + 'static {
    async fn on_response(&self, responder: ClientId, tag: String, response: Response);
}

#[async_trait]
impl<F, Fut> NotificationHandler for F
where
    F: Fn(ClientId, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_notification(&self, sender: ClientId, message: Message) {
        (self)(sender, message).await
    }
}

#[async_trait]
impl<F, Fut> CallHandler for F
where
    F: Fn(ClientId, MessageId, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    async fn on_call(&self, sender: ClientId, msg_id: MessageId, message: Message) -> CallResult {
        (self)(sender, msg_id, message).await
    }
}

#[async_trait]
impl<F, Fut> ResponseHandler for F
where
    F: Fn(ClientId, String, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_response(&self, responder: ClientId, tag: String, response: Response) {
        (self)(responder, tag, response).await
    }
}

/// Handlers keyed by pattern; lookups use the most specific match.
pub(crate) struct PatternTable<H: ?Sized> {
    entries: BTreeMap<MTypePattern, Arc<H>>,
}

impl<H: ?Sized> Default for PatternTable<H> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<H: ?Sized> PatternTable<H> {
    /// Bind `handler`, replacing any handler already bound to `pattern`.
    pub fn bind(&mut self, pattern: MTypePattern, handler: Arc<H>) -> bool {
        self.entries.insert(pattern, handler).is_some()
    }

    pub fn resolve(&self, mtype: &str) -> Option<(&MTypePattern, Arc<H>)> {
        self.entries
            .iter()
            .filter(|(pattern, _)| pattern.matches(mtype))
            .max_by_key(|(pattern, _)| pattern.specificity())
            .map(|(pattern, handler)| (pattern, Arc::clone(handler)))
    }

    pub fn patterns(&self) -> impl Iterator<Item = &MTypePattern> {
        self.entries.keys()
    }
}

/// Everything a client has bound.
#[derive(Default)]
pub(crate) struct Handlers {
    pub notifications: PatternTable<dyn NotificationHandler>,
    pub calls: PatternTable<dyn CallHandler>,
    pub responses: HashMap<String, Arc<dyn ResponseHandler>>,
}

impl Handlers {
    /// The subscription table these bindings imply.
    pub fn subscriptions(&self) -> SubscriptionTable {
        let mut table = SubscriptionTable::new();
        for pattern in self.notifications.patterns() {
            table.add(pattern.clone(), HandlerKind::Notification);
        }
        for pattern in self.calls.patterns() {
            table.add(pattern.clone(), HandlerKind::Call);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pattern(p: &str) -> MTypePattern {
        MTypePattern::parse(p).unwrap()
    }

    #[test]
    fn test_resolve_prefers_specific_pattern() {
        let mut table: PatternTable<str> = PatternTable::default();
        table.bind(pattern("samp.*"), Arc::from("broad"));
        table.bind(pattern("samp.app.*"), Arc::from("narrow"));

        let (matched, label) = table.resolve("samp.app.echo").unwrap();
        assert_eq!(matched.as_str(), "samp.app.*");
        assert_eq!(&*label, "narrow");
        assert_eq!(&*table.resolve("samp.hub.event.register").unwrap().1, "broad");
        assert!(table.resolve("other.thing").is_none());
    }

    #[test]
    fn test_rebind_overwrites() {
        let mut table: PatternTable<str> = PatternTable::default();
        assert!(!table.bind(pattern("samp.test"), Arc::from("first")));
        assert!(table.bind(pattern("samp.test"), Arc::from("second")));
        assert_eq!(table.patterns().count(), 1);
        assert_eq!(&*table.resolve("samp.test").unwrap().1, "second");
    }

    #[test]
    fn test_subscriptions_merge_roles() {
        let mut handlers = Handlers::default();
        let noop_notify: Arc<dyn NotificationHandler> =
            Arc::new(|_: ClientId, _: Message| async {});
        let noop_call: Arc<dyn CallHandler> =
            Arc::new(|_: ClientId, _: MessageId, _: Message| async { CallResult::Ok(None) });
        handlers
            .notifications
            .bind(pattern("samp.app.*"), Arc::clone(&noop_notify));
        handlers.notifications.bind(pattern("samp.hub.*"), noop_notify);
        handlers.calls.bind(pattern("samp.app.*"), noop_call);

        let table = handlers.subscriptions();
        assert_eq!(table.get(&pattern("samp.app.*")), Some(HandlerKind::Both));
        assert_eq!(
            table.get(&pattern("samp.hub.*")),
            Some(HandlerKind::Notification)
        );
    }

    #[tokio::test]
    async fn test_closure_handlers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handler: Arc<dyn NotificationHandler> = Arc::new(move |_: ClientId, _: Message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        handler
            .on_notification(ClientId::from("cli#1"), Message::new("samp.test"))
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let call: Arc<dyn CallHandler> =
            Arc::new(|_: ClientId, _: MessageId, message: Message| async move {
                CallResult::Err(format!("cannot handle {}", message.mtype))
            });
        let outcome = call
            .on_call(
                ClientId::from("cli#2"),
                MessageId::from("msg-1"),
                Message::new("samp.test"),
            )
            .await;
        assert_eq!(outcome, Err("cannot handle samp.test".to_string()));
    }
}
