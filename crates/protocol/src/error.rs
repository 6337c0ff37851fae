//! Protocol error taxonomy

use crate::message::BodyKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Corrupt or truncated frame. Terminates the owning session only.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Unrecognized cipher tag, which implies peer misconfiguration.
    #[error("unsupported encryption tag: 0x{0:02x}")]
    UnsupportedEncryption(u8),

    /// The decoded body belongs to the other side of the tunnel.
    #[error("unexpected {actual:?} body, expected {expected:?}")]
    UnexpectedBody { expected: BodyKind, actual: BodyKind },

    #[error("envelope token must not be empty")]
    EmptyToken,

    #[error("body too large: {size} bytes (max: {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("body serialization failed: {0}")]
    Serialize(String),

    #[error("body deserialization failed: {0}")]
    Deserialize(String),

    #[error("cipher: {0}")]
    Crypto(#[from] burrow_crypto::CryptoError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}
