//! Burrow crypto - the pluggable cipher strategy for envelope bodies
//!
//! This crate provides:
//! - `EncryptionType`: the one-byte cipher tag carried in every wire frame
//! - `CipherSuite`: seal/open pipelines keyed by that tag
//! - Passphrase-based AES key derivation (SHA-256, domain separated)

mod cipher;

pub use cipher::*;
