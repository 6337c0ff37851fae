//! Framed envelope I/O over async byte streams

use burrow_crypto::{CipherSuite, EncryptionType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::message::{BodyKind, Envelope};
use crate::wire;

/// Read one envelope frame from the stream.
///
/// Returns `Ok(None)` on a clean close at a frame boundary; an EOF inside a
/// frame is reported as `MalformedFrame`. The declared body length is
/// checked against [`wire::MAX_BODY_LEN`] before the body is allocated.
pub async fn read_envelope<R>(
    reader: &mut R,
    expected: BodyKind,
    suite: &CipherSuite,
) -> Result<Option<Envelope>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let token_len = u16::from_be_bytes(len_buf) as usize;
    if token_len == 0 {
        return Err(ProtocolError::EmptyToken);
    }

    let mut token = vec![0u8; token_len];
    read_frame_exact(reader, &mut token).await?;
    let token = String::from_utf8(token)
        .map_err(|_| ProtocolError::MalformedFrame("token is not utf-8"))?;

    let mut tail = [0u8; 5];
    read_frame_exact(reader, &mut tail).await?;
    let tag = tail[0];
    let encryption =
        EncryptionType::from_tag(tag).ok_or(ProtocolError::UnsupportedEncryption(tag))?;
    let body_len = u32::from_be_bytes([tail[1], tail[2], tail[3], tail[4]]) as usize;
    if body_len > wire::MAX_BODY_LEN {
        return Err(ProtocolError::BodyTooLarge {
            size: body_len,
            max: wire::MAX_BODY_LEN,
        });
    }

    let mut body = vec![0u8; body_len];
    read_frame_exact(reader, &mut body).await?;

    wire::decode_body(token, encryption, &body, expected, suite).map(Some)
}

/// Encode and write one envelope frame.
pub async fn write_envelope<W>(
    writer: &mut W,
    envelope: &Envelope,
    suite: &CipherSuite,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = wire::encode(envelope, suite)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// `read_exact` with mid-frame EOF reported as a malformed frame.
async fn read_frame_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::MalformedFrame("stream ended inside a frame"))
        }
        Err(e) => Err(e.into()),
    }
}
