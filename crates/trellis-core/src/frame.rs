//! Length-prefixed framing on a stream socket.
//!
//! Wire format: `| length: u32 LE | body: bytes[length] |`.
//!
//! Two reserved shapes exist at this layer:
//!   - `length == 0` is the disconnect marker and surfaces as
//!     [`ChannelError::Disconnected`].
//!   - a body of exactly `[0x00]` is the role-reversal signal. It is sent
//!     in plaintext; the cipher stage appends a 16-byte tag to every
//!     payload, so an encrypted frame can never be one byte long.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ChannelError;

/// Maximum frame body. Larger frames indicate a corrupt or hostile peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// The single-byte role-reversal signal body.
pub const REVERT_SIGNAL: [u8; 1] = [0x00];

/// A frame as read off the wire, before decryption.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// An opaque (encrypted) body.
    Body(Vec<u8>),
    /// The role-reversal signal.
    Revert,
}

/// Write one frame: length prefix then body.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(ChannelError::Oversize {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Write the role-reversal signal.
pub async fn write_revert<W>(writer: &mut W) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &REVERT_SIGNAL).await
}

/// Read one frame in two steps: the length, then the body.
///
/// A clean EOF before the length prefix, or a zero-length frame, both
/// surface as [`ChannelError::Disconnected`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ChannelError::Disconnected,
            _ => ChannelError::Io(e),
        });
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    if len == 0 {
        return Err(ChannelError::Disconnected);
    }
    if len > MAX_FRAME_LEN {
        return Err(ChannelError::Oversize {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    if body.as_slice() == REVERT_SIGNAL {
        return Ok(Frame::Revert);
    }
    Ok(Frame::Body(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello mesh").await.unwrap();
        let frame = read_frame(&mut b).await.unwrap();
        assert_eq!(frame, Frame::Body(b"hello mesh".to_vec()));
    }

    #[tokio::test]
    async fn two_step_read_sees_frames_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"second").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), Frame::Body(b"first".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Frame::Body(b"second".to_vec()));
    }

    #[tokio::test]
    async fn zero_length_frame_is_a_disconnect() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&0u32.to_le_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ChannelError::Disconnected));
    }

    #[tokio::test]
    async fn clean_eof_is_a_disconnect() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ChannelError::Disconnected));
    }

    #[tokio::test]
    async fn revert_signal_is_distinguished() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_revert(&mut a).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), Frame::Revert);
    }

    #[tokio::test]
    async fn single_nonzero_byte_is_a_body() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &[0x01]).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), Frame::Body(vec![0x01]));
    }

    #[tokio::test]
    async fn oversize_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ChannelError::Oversize { .. }));
    }
}
