//! `ClassChat` hub library.
//!
//! Exposes the hub server for use in tests and embedding. The hub accepts
//! WebSocket connections, fans broadcasts out to topic subscribers, and
//! serves the message-thread RPCs backing the inbox.

pub mod config;
pub mod hub;
pub mod store;
pub mod topics;
