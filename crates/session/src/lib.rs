//! Burrow session bookkeeping, shared by the agent and the proxy
//!
//! This crate provides:
//! - `SessionRegistry`: the single process-wide map from a client-connection
//!   id to the paired local/remote handles of a tunnel session
//! - `IdleTracker`: heartbeat scheduling and stale-link expiry

mod liveness;
mod registry;

pub use liveness::{IdleEvent, IdleTracker};
pub use registry::{RegistryError, Session, SessionRegistry};
