//! Core types and traits for the SAMP message hub.
//!
//! This crate defines the data structures shared by the hub kernel, the wire
//! binding and the client library: identities, MType patterns, messages,
//! responses, errors and the [`proxy::HubProxy`] operation set. It contains no
//! routing or tracking logic.

pub mod config;
pub mod error;
pub mod ids;
pub mod message;
pub mod mtype;
pub mod proxy;
