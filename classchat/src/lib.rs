//! `ClassChat` realtime client library.
//!
//! Typing indicators, hub connection monitoring with backoff, and message
//! delivery tracking on top of a topic-based realtime hub.

pub mod config;
pub mod connection;
pub mod display;
pub mod realtime;
pub mod threads;
pub mod typing;
