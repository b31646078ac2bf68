//! Client side of the SAMP hub.
//!
//! A [`Client`] wraps any [`samphub_types::proxy::HubProxy`] (the in-process
//! hub or a TCP connection), keeps the handlers bound by the application and
//! runs a receive loop that dispatches pushed notifications, calls and
//! responses to them.

pub mod client;
pub mod handler;

pub use client::{Client, ClientConfig};
pub use handler::{CallHandler, CallResult, NotificationHandler, ResponseHandler};
