//! TCP binding of the SAMP hub.
//!
//! Requests, responses and pushes travel as JSON frames, each prefixed with
//! a 4-byte big-endian length. [`HubNode`] serves an in-process
//! [`samphub_kernel::Hub`] over TCP; [`RemoteHub`] is the client side and
//! implements [`samphub_types::proxy::HubProxy`].

pub mod message;
pub mod node;
pub mod remote;

pub use message::{HubRequest, WireMessage, WireMessageKind, WireResponse};
pub use node::{HubNode, WireError};
pub use remote::RemoteHub;
