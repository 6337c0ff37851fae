//! Burrow protocol - envelope definitions and wire codec
//!
//! This crate defines the agent<->proxy wire protocol:
//! - `Envelope`: the outer record carrying the shared token, the cipher tag
//!   and a typed body
//! - `MessageBody` / `AgentBody` / `ProxyBody`: the tagged bodies exchanged
//!   between the two sides
//! - `wire`: the big-endian frame codec
//! - `framed`: envelope read/write over async byte streams
//!
//! Bodies are serialized with rkyv before the cipher transform is applied.
//! The codec never interprets body semantics; that belongs to the session
//! state machines on either side.

mod error;
pub mod framed;
mod message;
pub mod wire;

pub use error::ProtocolError;
pub use message::{
    AgentBody, AgentBodyType, BodyKind, Envelope, MessageBody, ProxyBody, ProxyBodyType, fresh_id,
};
pub use wire::MAX_BODY_LEN;
