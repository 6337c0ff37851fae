//! Client-protocol adapters
//!
//! Each accepted client connection speaks one of SOCKS4, SOCKS5 or HTTP.
//! The adapter is a sans-io state machine: the session feeds it raw bytes
//! and it yields either an interim reply (SOCKS5 method selection), a parsed
//! connect request, or a request for more data. The protocol is detected
//! from the first byte of the stream.

mod http;
mod socks;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error("unsupported protocol version: 0x{0:02x}")]
    UnsupportedVersion(u8),

    #[error("unsupported command: 0x{0:02x}")]
    UnsupportedCommand(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Socks4,
    Socks5,
    Http,
}

/// A parsed connect request.
///
/// `remainder` holds client bytes that arrived beyond the handshake and must
/// be forwarded to the target once the relay is activated. For transparent
/// HTTP this is the re-serialized request head plus any buffered body.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub remainder: Vec<u8>,
}

#[derive(Debug, PartialEq)]
pub enum Handshake {
    /// The buffered bytes do not yet hold a complete step.
    NeedMoreData,
    /// Protocol-level bytes to write back to the client before continuing.
    Reply(Vec<u8>),
    /// The handshake is complete.
    Connect(ConnectRequest),
}

enum State {
    Socks4,
    Socks5(socks::Socks5State),
    Http {
        /// Whether the request was a CONNECT tunnel (set once parsed).
        tunnel: bool,
    },
}

pub struct ClientProtocol {
    state: State,
}

impl ClientProtocol {
    /// Pick the protocol from the first byte of the client stream.
    pub fn detect(first_byte: u8) -> Self {
        let state = match first_byte {
            socks::SOCKS4_VERSION => State::Socks4,
            socks::SOCKS5_VERSION => State::Socks5(socks::Socks5State::Greeting),
            _ => State::Http { tunnel: false },
        };
        Self { state }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self.state {
            State::Socks4 => ProtocolKind::Socks4,
            State::Socks5(_) => ProtocolKind::Socks5,
            State::Http { .. } => ProtocolKind::Http,
        }
    }

    /// Advance the handshake with the bytes buffered so far. Consumed bytes
    /// are drained from `buf`.
    pub fn advance(&mut self, buf: &mut Vec<u8>) -> Result<Handshake, AdapterError> {
        match &mut self.state {
            State::Socks4 => socks::advance_socks4(buf),
            State::Socks5(state) => socks::advance_socks5(state, buf),
            State::Http { tunnel } => http::advance(buf, tunnel),
        }
    }

    /// The protocol-specific reply the client expects for a connect outcome.
    /// Empty for transparent HTTP success, where the target's own response
    /// is the reply.
    pub fn connect_reply(&self, success: bool) -> Vec<u8> {
        match &self.state {
            State::Socks4 => socks::socks4_reply(success),
            State::Socks5(_) => socks::socks5_reply(success),
            State::Http { tunnel } => http::reply(*tunnel, success),
        }
    }
}
