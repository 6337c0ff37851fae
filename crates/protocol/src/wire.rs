//! Wire codec for envelope frames
//!
//! Frame layout, all integers big-endian:
//!
//! ```text
//! [token_len: u16][token: bytes][cipher_tag: u8][body_len: u32][body: bytes]
//! ```
//!
//! `body` is the cipher-transformed rkyv serialization of the message body.

use burrow_crypto::{CipherSuite, EncryptionType};

use crate::error::ProtocolError;
use crate::message::{BodyKind, Envelope, MessageBody};

/// Upper bound on the transformed body, enforced before any allocation.
pub const MAX_BODY_LEN: usize = 8 * 1024 * 1024;

/// Encode an envelope into a self-describing frame.
pub fn encode(envelope: &Envelope, suite: &CipherSuite) -> Result<Vec<u8>, ProtocolError> {
    if envelope.token.is_empty() {
        return Err(ProtocolError::EmptyToken);
    }
    let token = envelope.token.as_bytes();
    if token.len() > u16::MAX as usize {
        return Err(ProtocolError::MalformedFrame("token too long"));
    }

    let plain = rkyv::to_bytes::<rkyv::rancor::Error>(&envelope.body)
        .map_err(|e| ProtocolError::Serialize(e.to_string()))?;
    let body = suite.seal(envelope.encryption, &plain)?;
    if body.len() > MAX_BODY_LEN {
        return Err(ProtocolError::BodyTooLarge {
            size: body.len(),
            max: MAX_BODY_LEN,
        });
    }

    let mut out = Vec::with_capacity(2 + token.len() + 1 + 4 + body.len());
    out.extend_from_slice(&(token.len() as u16).to_be_bytes());
    out.extend_from_slice(token);
    out.push(envelope.encryption.tag());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a frame produced by `encode`, verifying that the body belongs to
/// the expected side of the tunnel.
pub fn decode(
    buf: &[u8],
    expected: BodyKind,
    suite: &CipherSuite,
) -> Result<Envelope, ProtocolError> {
    if buf.len() < 2 {
        return Err(ProtocolError::MalformedFrame("truncated token length"));
    }
    let token_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if token_len == 0 {
        return Err(ProtocolError::EmptyToken);
    }
    let rest = &buf[2..];
    if rest.len() < token_len + 1 + 4 {
        return Err(ProtocolError::MalformedFrame("truncated header"));
    }

    let token = std::str::from_utf8(&rest[..token_len])
        .map_err(|_| ProtocolError::MalformedFrame("token is not utf-8"))?
        .to_string();
    let tag = rest[token_len];
    let encryption =
        EncryptionType::from_tag(tag).ok_or(ProtocolError::UnsupportedEncryption(tag))?;

    let off = token_len + 1;
    let body_len =
        u32::from_be_bytes([rest[off], rest[off + 1], rest[off + 2], rest[off + 3]]) as usize;
    if body_len > MAX_BODY_LEN {
        return Err(ProtocolError::BodyTooLarge {
            size: body_len,
            max: MAX_BODY_LEN,
        });
    }
    let body_start = off + 4;
    if rest.len() - body_start < body_len {
        return Err(ProtocolError::MalformedFrame(
            "body length exceeds available bytes",
        ));
    }

    decode_body(
        token,
        encryption,
        &rest[body_start..body_start + body_len],
        expected,
        suite,
    )
}

/// Shared tail of `decode` and the framed reader: undo the cipher transform
/// and deserialize the body.
pub(crate) fn decode_body(
    token: String,
    encryption: EncryptionType,
    sealed: &[u8],
    expected: BodyKind,
    suite: &CipherSuite,
) -> Result<Envelope, ProtocolError> {
    let plain = suite.open(encryption, sealed)?;
    let body = rkyv::from_bytes::<MessageBody, rkyv::rancor::Error>(&plain)
        .map_err(|e| ProtocolError::Deserialize(e.to_string()))?;
    if body.kind() != expected {
        return Err(ProtocolError::UnexpectedBody {
            expected,
            actual: body.kind(),
        });
    }
    Ok(Envelope {
        token,
        encryption,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AgentBody, ProxyBody};

    fn suite() -> CipherSuite {
        CipherSuite::from_passphrase("wire-tests")
    }

    #[test]
    fn roundtrip_every_agent_body_type() {
        let suite = suite();
        let bodies = [
            AgentBody::connect("session-1", "93.184.216.34", 80),
            AgentBody::data(vec![1, 2, 3, 4, 5]),
            AgentBody::heartbeat(),
            AgentBody::disconnect(),
        ];

        for body in bodies {
            let envelope = Envelope::agent("token", EncryptionType::Aes, body);
            let frame = encode(&envelope, &suite).unwrap();
            let decoded = decode(&frame, BodyKind::Agent, &suite).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn roundtrip_every_proxy_body_type() {
        let suite = suite();
        let bodies = [
            ProxyBody::connect_success("session-1"),
            ProxyBody::connect_failure("session-1"),
            ProxyBody::data(b"response".to_vec()),
            ProxyBody::heartbeat(),
            ProxyBody::disconnect(),
        ];

        for body in bodies {
            let envelope = Envelope::proxy("token", EncryptionType::AesBase64, body);
            let frame = encode(&envelope, &suite).unwrap();
            let decoded = decode(&frame, BodyKind::Proxy, &suite).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn roundtrip_every_cipher_tag() {
        let suite = suite();
        for cipher in EncryptionType::ALL {
            let envelope = Envelope::agent("token", cipher, AgentBody::data(vec![0xde, 0xad]));
            let frame = encode(&envelope, &suite).unwrap();
            assert_eq!(decode(&frame, BodyKind::Agent, &suite).unwrap(), envelope);
        }
    }

    #[test]
    fn truncated_body_is_malformed() {
        let suite = suite();
        let envelope = Envelope::agent("token", EncryptionType::Plain, AgentBody::heartbeat());
        let frame = encode(&envelope, &suite).unwrap();

        // Drop the last byte so the declared body length exceeds the rest.
        let truncated = &frame[..frame.len() - 1];
        assert!(matches!(
            decode(truncated, BodyKind::Agent, &suite),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn truncated_header_is_malformed() {
        let suite = suite();
        assert!(matches!(
            decode(&[0x00], BodyKind::Agent, &suite),
            Err(ProtocolError::MalformedFrame(_))
        ));
        assert!(matches!(
            decode(&[0x00, 0x05, b'a'], BodyKind::Agent, &suite),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn unknown_cipher_tag_is_rejected() {
        let suite = suite();
        let envelope = Envelope::agent("token", EncryptionType::Plain, AgentBody::heartbeat());
        let mut frame = encode(&envelope, &suite).unwrap();

        // The tag byte sits right after the token.
        frame[2 + "token".len()] = 0x7f;
        assert!(matches!(
            decode(&frame, BodyKind::Agent, &suite),
            Err(ProtocolError::UnsupportedEncryption(0x7f))
        ));
    }

    #[test]
    fn empty_token_is_rejected_on_encode() {
        let suite = suite();
        let envelope = Envelope::agent("", EncryptionType::Plain, AgentBody::heartbeat());
        assert!(matches!(
            encode(&envelope, &suite),
            Err(ProtocolError::EmptyToken)
        ));
    }

    #[test]
    fn wrong_body_variant_is_rejected() {
        let suite = suite();
        let envelope = Envelope::agent("token", EncryptionType::Aes, AgentBody::heartbeat());
        let frame = encode(&envelope, &suite).unwrap();
        assert!(matches!(
            decode(&frame, BodyKind::Proxy, &suite),
            Err(ProtocolError::UnexpectedBody { .. })
        ));
    }
}
