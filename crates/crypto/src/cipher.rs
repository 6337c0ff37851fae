//! Cipher tags and the seal/open pipelines behind them

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("unknown cipher tag: 0x{0:02x}")]
    UnknownCipher(u8),

    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("ciphertext too short")]
    CiphertextTooShort,

    #[error("invalid base64 payload")]
    InvalidBase64,
}

/// Cipher pipeline applied to an envelope body before it is framed.
///
/// The tag names the encrypt-side pipeline in application order:
/// `AesBase64` AES-encrypts first and Base64-encodes the result. `open`
/// runs the same pipeline in reverse. Both legs of a session use the tag
/// chosen by the session originator; an unregistered tag byte fails closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    Plain,
    Base64,
    Aes,
    AesBase64,
}

impl EncryptionType {
    pub const ALL: [EncryptionType; 4] = [
        EncryptionType::Plain,
        EncryptionType::Base64,
        EncryptionType::Aes,
        EncryptionType::AesBase64,
    ];

    /// The one-byte tag carried in the wire frame header.
    pub fn tag(self) -> u8 {
        match self {
            EncryptionType::Plain => 0x00,
            EncryptionType::Base64 => 0x01,
            EncryptionType::Aes => 0x02,
            EncryptionType::AesBase64 => 0x03,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(EncryptionType::Plain),
            0x01 => Some(EncryptionType::Base64),
            0x02 => Some(EncryptionType::Aes),
            0x03 => Some(EncryptionType::AesBase64),
            _ => None,
        }
    }

    /// Parse a configuration name such as `"aes"` or `"aes-base64"`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "plain" => Some(EncryptionType::Plain),
            "base64" => Some(EncryptionType::Base64),
            "aes" => Some(EncryptionType::Aes),
            "aes-base64" => Some(EncryptionType::AesBase64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EncryptionType::Plain => "plain",
            EncryptionType::Base64 => "base64",
            EncryptionType::Aes => "aes",
            EncryptionType::AesBase64 => "aes-base64",
        }
    }
}

/// Process-wide cipher table, built once at startup and shared by reference.
///
/// All methods take `&self` and hold no mutable state, so concurrent use
/// from many sessions needs no locking.
#[derive(Clone)]
pub struct CipherSuite {
    aes: Aes256Gcm,
}

impl CipherSuite {
    /// Create a suite from a 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        let aes = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        Self { aes }
    }

    /// Create a suite from a shared passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::new(&derive_key(passphrase))
    }

    /// Transform a plaintext body for the wire.
    pub fn seal(&self, cipher: EncryptionType, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match cipher {
            EncryptionType::Plain => Ok(plain.to_vec()),
            EncryptionType::Base64 => Ok(BASE64.encode(plain).into_bytes()),
            EncryptionType::Aes => self.aes_seal(plain),
            EncryptionType::AesBase64 => {
                let sealed = self.aes_seal(plain)?;
                Ok(BASE64.encode(sealed).into_bytes())
            }
        }
    }

    /// Invert `seal` for a body received from the wire.
    pub fn open(&self, cipher: EncryptionType, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match cipher {
            EncryptionType::Plain => Ok(sealed.to_vec()),
            EncryptionType::Base64 => BASE64.decode(sealed).map_err(|_| CryptoError::InvalidBase64),
            EncryptionType::Aes => self.aes_open(sealed),
            EncryptionType::AesBase64 => {
                let decoded = BASE64.decode(sealed).map_err(|_| CryptoError::InvalidBase64)?;
                self.aes_open(&decoded)
            }
        }
    }

    /// AES-256-GCM with a random nonce.
    /// Returns: nonce (12 bytes) || ciphertext
    fn aes_seal(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .aes
            .encrypt(nonce, plain)
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt data produced by `aes_seal` (expects nonce || ciphertext).
    fn aes_open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < 12 {
            return Err(CryptoError::CiphertextTooShort);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.aes
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

/// Derive the AES key from the shared passphrase.
pub fn derive_key(passphrase: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(b"BURROW-CIPHER-KEY-DERIVE");
    hasher.update(passphrase.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip_all_tags() {
        let suite = CipherSuite::from_passphrase("test");
        let payload = b"tunnel bytes".to_vec();

        for cipher in EncryptionType::ALL {
            let sealed = suite.seal(cipher, &payload).unwrap();
            let opened = suite.open(cipher, &sealed).unwrap();
            assert_eq!(opened, payload, "roundtrip failed for {}", cipher.name());
        }
    }

    #[test]
    fn roundtrip_empty_payload() {
        let suite = CipherSuite::from_passphrase("test");
        for cipher in EncryptionType::ALL {
            let sealed = suite.seal(cipher, &[]).unwrap();
            assert_eq!(suite.open(cipher, &sealed).unwrap(), Vec::<u8>::new());
        }
    }

    #[test]
    fn roundtrip_max_frame_payload() {
        let suite = CipherSuite::from_passphrase("test");
        let payload: Vec<u8> = (0..burrow_protocol::MAX_BODY_LEN)
            .map(|i| (i % 251) as u8)
            .collect();

        for cipher in EncryptionType::ALL {
            let sealed = suite.seal(cipher, &payload).unwrap();
            assert_eq!(suite.open(cipher, &sealed).unwrap(), payload);
        }
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let suite1 = CipherSuite::from_passphrase("one");
        let suite2 = CipherSuite::from_passphrase("two");

        let sealed = suite1.seal(EncryptionType::Aes, b"secret").unwrap();
        assert!(matches!(
            suite2.open(EncryptionType::Aes, &sealed),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn unknown_tag_fails_closed() {
        assert_eq!(EncryptionType::from_tag(0x7f), None);
        assert_eq!(EncryptionType::from_name("rot13"), None);
    }

    #[test]
    fn tag_roundtrip() {
        for cipher in EncryptionType::ALL {
            assert_eq!(EncryptionType::from_tag(cipher.tag()), Some(cipher));
            assert_eq!(EncryptionType::from_name(cipher.name()), Some(cipher));
        }
    }

    #[test]
    fn garbled_base64_fails() {
        let suite = CipherSuite::from_passphrase("test");
        assert!(matches!(
            suite.open(EncryptionType::Base64, &[0xff, 0xfe, 0xfd]),
            Err(CryptoError::InvalidBase64)
        ));
    }

    #[test]
    fn key_derivation_is_stable() {
        assert_eq!(derive_key("secret"), derive_key("secret"));
        assert_ne!(derive_key("secret"), derive_key("other"));
    }
}
