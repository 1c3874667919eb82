//! Protocol header negotiation.
//!
//! An AMQP client opens with the eight bytes `AMQP\0\0\x09\x01`. Anything
//! else is answered with the header this server speaks before the socket is
//! closed.

use thiserror::Error;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::PROTOCOL_HEADER;

/// Failure to read a supported protocol header.
#[derive(Debug, Error)]
pub enum PreambleError {
    /// The peer sent a different header.
    #[error("unsupported protocol header {0:02x?}")]
    Mismatch([u8; 8]),
    /// The stream failed or closed before eight bytes arrived.
    #[error("reading protocol header: {0}")]
    Io(#[from] io::Error),
}

/// Read exactly eight bytes and check them against [`PROTOCOL_HEADER`].
///
/// # Errors
///
/// Returns [`PreambleError::Mismatch`] carrying the received bytes when they
/// differ, or [`PreambleError::Io`] if the stream fails first.
pub async fn read_protocol_header<R>(reader: &mut R) -> Result<(), PreambleError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0_u8; 8];
    reader.read_exact(&mut header).await?;
    if header == PROTOCOL_HEADER {
        Ok(())
    } else {
        Err(PreambleError::Mismatch(header))
    }
}

/// Tell the peer which protocol header this server supports.
///
/// # Errors
///
/// Propagates write failures.
pub async fn reject_protocol_header<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&PROTOCOL_HEADER).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn accepts_supported_header_split_across_writes() {
        let (mut client, mut server) = duplex(64);
        let task = tokio::spawn(async move { read_protocol_header(&mut server).await });
        client.write_all(b"AMQP").await.expect("write");
        client.write_all(&[0, 0, 9, 1]).await.expect("write");
        task.await.expect("join").expect("header accepted");
    }

    #[tokio::test]
    async fn reports_mismatched_bytes() {
        let mut input: &[u8] = b"HTTP/1.1";
        match read_protocol_header(&mut input).await {
            Err(PreambleError::Mismatch(bytes)) => assert_eq!(&bytes, b"HTTP/1.1"),
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_stream_is_an_io_error() {
        let mut input: &[u8] = b"AMQP";
        let err = read_protocol_header(&mut input).await.expect_err("eof");
        assert!(matches!(err, PreambleError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn rejection_writes_supported_header() {
        let mut out = Vec::new();
        reject_protocol_header(&mut out).await.expect("write");
        assert_eq!(out, PROTOCOL_HEADER);
    }
}
