//! Client registry — tracks registered clients, their credentials, metadata
//! and subscription tables.
//!
//! The [`Registry`] is a thread-safe structure owned by one hub. Records are
//! kept in registration order so broadcasts iterate deterministically, and are
//! indexed by the SHA-256 digest of the client's private key rather than the
//! key itself.

use crate::transport::PushTransport;
use chrono::{DateTime, Utc};
use samphub_types::error::{HubError, HubResult};
use samphub_types::ids::{ClientId, PrivateKey};
use samphub_types::message::Metadata;
use samphub_types::mtype::SubscriptionTable;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A registered client, as stored by the hub.
pub struct ClientRecord {
    pub client_id: ClientId,
    /// Registration sequence number; orders broadcasts.
    pub seq: u64,
    pub key_digest: String,
    pub metadata: Metadata,
    pub subscriptions: SubscriptionTable,
    pub transport: Arc<dyn PushTransport>,
    pub registered_at: DateTime<Utc>,
    /// Cleared when a delivery fails; the next housekeeping pass reaps it.
    pub live: bool,
}

impl std::fmt::Debug for ClientRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRecord")
            .field("client_id", &self.client_id)
            .field("seq", &self.seq)
            .field("subscriptions", &self.subscriptions)
            .field("registered_at", &self.registered_at)
            .field("live", &self.live)
            .finish_non_exhaustive()
    }
}

/// Routing snapshot of one client.
#[derive(Clone)]
pub struct ClientEntry {
    pub client_id: ClientId,
    pub subscriptions: SubscriptionTable,
    pub transport: Arc<dyn PushTransport>,
}

#[derive(Default)]
struct RegistryInner {
    clients: BTreeMap<u64, ClientRecord>,
    by_key: HashMap<String, u64>,
    by_id: HashMap<ClientId, u64>,
    /// Last issued sequence number. Never decreases, so ids are never reused.
    last_seq: u64,
    closed: bool,
}

impl RegistryInner {
    fn seq_for_key(&self, key: &PrivateKey) -> HubResult<u64> {
        self.by_key
            .get(&key.digest())
            .copied()
            .ok_or_else(|| HubError::Auth("unknown private key".to_string()))
    }

    fn record_for_key(&mut self, key: &PrivateKey) -> HubResult<&mut ClientRecord> {
        let seq = self.seq_for_key(key)?;
        self.clients
            .get_mut(&seq)
            .ok_or_else(|| HubError::Auth("unknown private key".to_string()))
    }

    fn record_for_id(&self, client_id: &ClientId) -> HubResult<&ClientRecord> {
        self.by_id
            .get(client_id)
            .and_then(|seq| self.clients.get(seq))
            .ok_or_else(|| HubError::Protocol(format!("client {client_id} is not registered")))
    }

    fn remove_seq(&mut self, seq: u64) -> Option<ClientRecord> {
        let record = self.clients.remove(&seq)?;
        self.by_key.remove(&record.key_digest);
        self.by_id.remove(&record.client_id);
        Some(record)
    }
}

/// Thread-safe registry of all registered clients.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new client and hand out its credentials.
    ///
    /// Fails with [`HubError::Auth`] once [`Registry::close`] has been called.
    pub fn register(&self, transport: Arc<dyn PushTransport>) -> HubResult<(ClientId, PrivateKey)> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return Err(HubError::Auth(
                "hub is shutting down, registration refused".to_string(),
            ));
        }

        inner.last_seq += 1;
        let seq = inner.last_seq;
        let client_id = ClientId::from_sequence(seq);
        let private_key = PrivateKey::generate();
        let key_digest = private_key.digest();

        inner.by_key.insert(key_digest.clone(), seq);
        inner.by_id.insert(client_id.clone(), seq);
        inner.clients.insert(
            seq,
            ClientRecord {
                client_id: client_id.clone(),
                seq,
                key_digest,
                metadata: Metadata::new(),
                subscriptions: SubscriptionTable::new(),
                transport,
                registered_at: Utc::now(),
                live: true,
            },
        );
        debug!(client = %client_id, "Client registered");
        Ok((client_id, private_key))
    }

    /// Resolve a private key to its owner's public id.
    pub fn authenticate(&self, key: &PrivateKey) -> HubResult<ClientId> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let seq = inner.seq_for_key(key)?;
        inner
            .clients
            .get(&seq)
            .map(|r| r.client_id.clone())
            .ok_or_else(|| HubError::Auth("unknown private key".to_string()))
    }

    /// Remove the client owning `key`. A second call with the same key fails.
    pub fn unregister(&self, key: &PrivateKey) -> HubResult<ClientRecord> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let seq = inner.seq_for_key(key)?;
        inner
            .remove_seq(seq)
            .ok_or_else(|| HubError::Auth("unknown private key".to_string()))
    }

    /// Remove a client by public id (liveness reaping, shutdown).
    pub fn remove(&self, client_id: &ClientId) -> Option<ClientRecord> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let seq = *inner.by_id.get(client_id)?;
        inner.remove_seq(seq)
    }

    /// Replace the caller's metadata wholesale.
    pub fn declare_metadata(&self, key: &PrivateKey, metadata: Metadata) -> HubResult<ClientId> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let record = inner.record_for_key(key)?;
        record.metadata = metadata;
        Ok(record.client_id.clone())
    }

    pub fn metadata(&self, client_id: &ClientId) -> HubResult<Metadata> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.record_for_id(client_id).map(|r| r.metadata.clone())
    }

    /// Replace the caller's subscription table wholesale.
    pub fn declare_subscriptions(
        &self,
        key: &PrivateKey,
        subscriptions: SubscriptionTable,
    ) -> HubResult<ClientId> {
        self.update_subscriptions(key, |table| *table = subscriptions)
            .map(|(id, _)| id)
    }

    /// Edit the caller's subscription table in place; returns the new table.
    pub fn update_subscriptions(
        &self,
        key: &PrivateKey,
        edit: impl FnOnce(&mut SubscriptionTable),
    ) -> HubResult<(ClientId, SubscriptionTable)> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let record = inner.record_for_key(key)?;
        edit(&mut record.subscriptions);
        Ok((record.client_id.clone(), record.subscriptions.clone()))
    }

    pub fn subscriptions(&self, client_id: &ClientId) -> HubResult<SubscriptionTable> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.record_for_id(client_id).map(|r| r.subscriptions.clone())
    }

    /// Public ids of all registered clients, in registration order.
    pub fn list_clients(&self) -> Vec<ClientId> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.clients.values().map(|r| r.client_id.clone()).collect()
    }

    /// Routing snapshot of every live client, in registration order.
    pub fn entries(&self) -> Vec<ClientEntry> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .clients
            .values()
            .filter(|r| r.live)
            .map(|r| ClientEntry {
                client_id: r.client_id.clone(),
                subscriptions: r.subscriptions.clone(),
                transport: Arc::clone(&r.transport),
            })
            .collect()
    }

    /// Routing snapshot of one live client.
    pub fn entry(&self, client_id: &ClientId) -> Option<ClientEntry> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let record = inner.record_for_id(client_id).ok()?;
        record.live.then(|| ClientEntry {
            client_id: record.client_id.clone(),
            subscriptions: record.subscriptions.clone(),
            transport: Arc::clone(&record.transport),
        })
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_id.contains_key(client_id)
    }

    /// Flag a client whose transport failed.
    pub fn mark_dead(&self, client_id: &ClientId) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(seq) = inner.by_id.get(client_id).copied() {
            if let Some(record) = inner.clients.get_mut(&seq) {
                record.live = false;
            }
        }
    }

    /// Clients that failed a delivery or whose transport has closed.
    pub fn dead_clients(&self) -> Vec<ClientId> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .clients
            .values()
            .filter(|r| !r.live || r.transport.is_closed())
            .map(|r| r.client_id.clone())
            .collect()
    }

    /// Refuse all further registrations.
    pub fn close(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.closed
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use samphub_types::mtype::{HandlerKind, MTypePattern};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn transport() -> Arc<dyn PushTransport> {
        // The receiver is leaked so the transport stays open for the test.
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        Arc::new(ChannelTransport::new(tx))
    }

    #[test]
    fn test_register_assigns_unique_ids_and_keys() {
        let registry = Registry::new();
        let (id1, key1) = registry.register(transport()).unwrap();
        let (id2, key2) = registry.register(transport()).unwrap();
        assert_ne!(id1, id2);
        assert_ne!(key1, key2);
        assert_eq!(registry.authenticate(&key1).unwrap(), id1);
        assert_eq!(registry.authenticate(&key2).unwrap(), id2);
    }

    #[test]
    fn test_ids_never_reused_after_unregister() {
        let registry = Registry::new();
        let (id1, key1) = registry.register(transport()).unwrap();
        registry.unregister(&key1).unwrap();
        let (id2, _) = registry.register(transport()).unwrap();
        assert_ne!(id1, id2);
        assert_eq!(id2.as_str(), "cli#2");
    }

    #[test]
    fn test_double_unregister_is_auth_error() {
        let registry = Registry::new();
        let (_, key) = registry.register(transport()).unwrap();
        registry.unregister(&key).unwrap();
        assert!(matches!(registry.unregister(&key), Err(HubError::Auth(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let registry = Registry::new();
        registry.register(transport()).unwrap();
        let bogus = PrivateKey::from("not-a-key");
        assert!(matches!(
            registry.declare_metadata(&bogus, Metadata::new()),
            Err(HubError::Auth(_))
        ));
        assert!(matches!(registry.authenticate(&bogus), Err(HubError::Auth(_))));
    }

    #[test]
    fn test_metadata_roundtrip_and_replace() {
        let registry = Registry::new();
        let (id, key) = registry.register(transport()).unwrap();

        let mut first = Metadata::new();
        first.insert("cli1.version".into(), json!("0.01"));
        first.insert("samp.name".into(), json!("Client 1"));
        registry.declare_metadata(&key, first.clone()).unwrap();
        assert_eq!(registry.metadata(&id).unwrap(), first);

        let mut second = Metadata::new();
        second.insert("cli1.version".into(), json!("0.02"));
        registry.declare_metadata(&key, second.clone()).unwrap();
        assert_eq!(registry.metadata(&id).unwrap(), second);
    }

    #[test]
    fn test_key_only_unlocks_its_own_record() {
        let registry = Registry::new();
        let (id1, key1) = registry.register(transport()).unwrap();
        let (id2, _) = registry.register(transport()).unwrap();

        let mut meta = Metadata::new();
        meta.insert("owner".into(), json!("one"));
        let owner = registry.declare_metadata(&key1, meta).unwrap();
        assert_eq!(owner, id1);
        assert!(registry.metadata(&id2).unwrap().is_empty());
    }

    #[test]
    fn test_subscriptions_update() {
        let registry = Registry::new();
        let (id, key) = registry.register(transport()).unwrap();
        let pattern = MTypePattern::parse("samp.app.*").unwrap();
        registry
            .update_subscriptions(&key, |t| t.add(pattern.clone(), HandlerKind::Call))
            .unwrap();
        assert_eq!(
            registry.subscriptions(&id).unwrap().get(&pattern),
            Some(HandlerKind::Call)
        );
    }

    #[test]
    fn test_list_clients_in_registration_order() {
        let registry = Registry::new();
        let ids: Vec<_> = (0..5)
            .map(|_| registry.register(transport()).unwrap().0)
            .collect();
        assert_eq!(registry.list_clients(), ids);
    }

    #[test]
    fn test_closed_registry_refuses_registration() {
        let registry = Registry::new();
        registry.close();
        assert!(matches!(registry.register(transport()), Err(HubError::Auth(_))));
    }

    #[test]
    fn test_dead_clients() {
        let registry = Registry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed_id, _) = registry
            .register(Arc::new(ChannelTransport::new(tx)))
            .unwrap();
        let (flagged_id, _) = registry.register(transport()).unwrap();
        let (healthy_id, _) = registry.register(transport()).unwrap();

        drop(rx);
        registry.mark_dead(&flagged_id);

        let dead = registry.dead_clients();
        assert_eq!(dead, vec![closed_id, flagged_id.clone()]);
        assert!(registry.entry(&flagged_id).is_none());
        assert!(registry.entry(&healthy_id).is_some());
    }
}
