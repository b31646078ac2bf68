//! Broker core of the SAMP message hub.
//!
//! ## Architecture
//!
//! - **Registry**: connected clients, their keys, metadata and subscriptions
//! - **Router**: resolves an MType (and optional target) to recipients
//! - **CallTracker**: correlates calls with replies, enforces deadlines
//! - **Hub**: the facade implementing [`samphub_types::proxy::HubProxy`]
//! - **PushTransport**: how the hub reaches a registered client

pub mod config;
pub mod events;
pub mod housekeeping;
pub mod hub;
pub mod registry;
pub mod router;
pub mod tracker;
pub mod transport;

pub use hub::Hub;
pub use registry::{ClientEntry, Registry};
pub use router::{Route, Router};
pub use tracker::{CallState, CallTracker, Resolution};
pub use transport::{ChannelTransport, PushTransport};
