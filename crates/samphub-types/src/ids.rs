//! Client and message identities.
//!
//! A registered client is known to everyone by its [`ClientId`] and proves
//! ownership of that id with a secret [`PrivateKey`]. The hub never keeps the
//! raw key around; it indexes client records by [`PrivateKey::digest`].

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Public id reserved for the hub itself (sender of `samp.hub.event.*`).
pub const HUB_CLIENT_ID: &str = "hub";

/// Length of a freshly generated private key, in bytes (before hex encoding).
const PRIVATE_KEY_BYTES: usize = 32;

/// Public, hub-assigned identity of a registered client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// The id for the `n`-th registration of a hub's lifetime.
    pub fn from_sequence(n: u64) -> Self {
        Self(format!("cli#{n}"))
    }

    /// The hub's own public id.
    pub fn hub() -> Self {
        Self(HUB_CLIENT_ID.to_string())
    }

    /// Whether this is the hub's own id.
    pub fn is_hub(&self) -> bool {
        self.0 == HUB_CLIENT_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Secret token authenticating every hub operation of one client.
///
/// `Debug` is redacted so keys do not leak into logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    /// Generate a new random, unguessable key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; PRIVATE_KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// SHA-256 digest of the key, hex encoded. Used as the registry index.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PrivateKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PrivateKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(***)")
    }
}

/// Opaque identifier correlating a call with its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// The id for the `n`-th call issued by a hub.
    pub fn from_sequence(n: u64) -> Self {
        Self(format!("msg-{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
