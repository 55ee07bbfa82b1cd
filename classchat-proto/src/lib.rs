//! Shared protocol definitions for the `ClassChat` realtime hub.

pub mod codec;
pub mod hub;
pub mod message;
pub mod thread;
pub mod typing;
