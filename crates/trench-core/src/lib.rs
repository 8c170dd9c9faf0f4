//! # trench-core
//!
//! Foundation types for the Trench chat core.
//!
//! - [`ids`]: branded UUID newtypes (`UserId`, `ConversationId`, ...)
//! - [`chat`]: messages, attachments, conversations
//! - [`logging`]: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod chat;
pub mod ids;
pub mod logging;
