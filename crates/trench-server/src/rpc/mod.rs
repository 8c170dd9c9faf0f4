//! JSON-RPC 2.0 layer: envelopes, codec, errors, registry, handlers.

pub mod codec;
pub mod context;
pub mod errors;
pub mod handlers;
pub mod registry;
pub mod types;
pub mod validation;
