//! Recipient resolution.
//!
//! Given an MType, a sender and an optional explicit target, the [`Router`]
//! decides who receives a message. Each candidate's most specific matching
//! pattern determines whether it can take the message in the requested role.

use crate::registry::Registry;
use crate::transport::PushTransport;
use samphub_types::error::{HubError, HubResult};
use samphub_types::ids::ClientId;
use samphub_types::message::SubscribedClient;
use samphub_types::mtype::{HandlerKind, MTypePattern, Role};
use std::sync::Arc;
use tracing::debug;

/// One resolved recipient.
#[derive(Clone)]
pub struct Route {
    pub client_id: ClientId,
    /// The pattern that selected this recipient.
    pub pattern: MTypePattern,
    pub kind: HandlerKind,
    pub transport: Arc<dyn PushTransport>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("client_id", &self.client_id)
            .field("pattern", &self.pattern)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Resolves recipients against a hub's registry.
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Resolve the recipients of `mtype` sent by `sender`.
    ///
    /// With a `target`, the result is exactly that client, or
    /// [`HubError::NotSubscribed`] if its best matching pattern cannot take
    /// the message in `role`. Without one, every other live client whose best
    /// match accepts `role` is returned, in registration order.
    pub fn resolve_recipients(
        &self,
        sender: &ClientId,
        mtype: &str,
        target: Option<&ClientId>,
        role: Role,
    ) -> HubResult<Vec<Route>> {
        match target {
            Some(target) => {
                let entry = self.registry.entry(target).ok_or_else(|| {
                    HubError::NotSubscribed(format!("client {target} is not registered"))
                })?;
                match entry.subscriptions.best_match(mtype) {
                    Some((pattern, kind)) if kind.accepts(role) => Ok(vec![Route {
                        client_id: entry.client_id.clone(),
                        pattern: pattern.clone(),
                        kind,
                        transport: Arc::clone(&entry.transport),
                    }]),
                    _ => Err(HubError::NotSubscribed(format!(
                        "client {target} has no {} handler for {mtype}",
                        role_name(role)
                    ))),
                }
            }
            None => {
                let routes: Vec<Route> = self
                    .registry
                    .entries()
                    .into_iter()
                    .filter(|e| &e.client_id != sender)
                    .filter_map(|e| {
                        let (pattern, kind) = e.subscriptions.best_match(mtype)?;
                        kind.accepts(role).then(|| Route {
                            client_id: e.client_id.clone(),
                            pattern: pattern.clone(),
                            kind,
                            transport: Arc::clone(&e.transport),
                        })
                    })
                    .collect();
                debug!(mtype, recipients = routes.len(), "Resolved broadcast");
                Ok(routes)
            }
        }
    }

    /// Every other client with any pattern matching `mtype`, whatever its kind.
    pub fn subscribed_clients(&self, sender: &ClientId, mtype: &str) -> Vec<SubscribedClient> {
        self.registry
            .entries()
            .into_iter()
            .filter(|e| &e.client_id != sender)
            .filter_map(|e| {
                let (pattern, kind) = e.subscriptions.best_match(mtype)?;
                Some(SubscribedClient {
                    client_id: e.client_id.clone(),
                    pattern: pattern.clone(),
                    kind,
                })
            })
            .collect()
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Notification => "notification",
        Role::Call => "call",
    }
}
