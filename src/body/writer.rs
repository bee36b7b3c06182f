use smol::io::AsyncWriteExt;

use super::BodyKind;
use crate::error::{Error, Result};
use crate::stream::AsyncStream;

/// Writes a single body to a stream according to its framing, enforcing
/// that a `ContentLength` writer emits exactly the declared byte count.
pub struct BodyWriter {
    kind: BodyKind,
    written: u64,
    declared: u64,
    closed: bool,
}

impl BodyWriter {
    pub fn new(kind: BodyKind) -> Self {
        let declared = match kind {
            BodyKind::ContentLength(n) => n,
            _ => 0,
        };
        Self { kind, written: 0, declared, closed: false }
    }

    pub async fn write(&mut self, stream: &mut dyn AsyncStream, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        if data.is_empty() {
            return Ok(());
        }
        match self.kind {
            BodyKind::Empty => {
                if !data.is_empty() {
                    return Err(Error::TooMuchWritten);
                }
                Ok(())
            }
            BodyKind::ContentLength(_) => {
                if self.written + data.len() as u64 > self.declared {
                    return Err(Error::TooMuchWritten);
                }
                stream.write_all(data).await?;
                self.written += data.len() as u64;
                Ok(())
            }
            BodyKind::Chunked => {
                let header = format!("{:x}\r\n", data.len());
                stream.write_all(header.as_bytes()).await?;
                stream.write_all(data).await?;
                stream.write_all(b"\r\n").await?;
                self.written += data.len() as u64;
                Ok(())
            }
            BodyKind::Unknown => {
                stream.write_all(data).await?;
                self.written += data.len() as u64;
                Ok(())
            }
        }
    }

    /// Finalizes the body, failing if a `ContentLength` writer came up short.
    pub async fn finish(&mut self, stream: &mut dyn AsyncStream) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.kind {
            BodyKind::ContentLength(_) if self.written < self.declared => {
                Err(Error::TooLittleWritten)
            }
            BodyKind::Chunked => {
                stream.write_all(b"0\r\n\r\n").await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::io::{AsyncRead, AsyncWrite};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct SinkStream(Vec<u8>);

    impl AsyncRead for SinkStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut [u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(0))
        }
    }

    impl AsyncWrite for SinkStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.get_mut().0.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncStream for SinkStream {
        fn set_nodelay(&self, _nodelay: bool) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn content_length_rejects_overrun() {
        smol::block_on(async {
            let mut stream = SinkStream(Vec::new());
            let mut writer = BodyWriter::new(BodyKind::ContentLength(3));
            writer.write(&mut stream, b"ab").await.unwrap();
            assert!(writer.write(&mut stream, b"cd").await.is_err());
        });
    }

    #[test]
    fn content_length_rejects_undershoot_on_finish() {
        smol::block_on(async {
            let mut stream = SinkStream(Vec::new());
            let mut writer = BodyWriter::new(BodyKind::ContentLength(3));
            writer.write(&mut stream, b"ab").await.unwrap();
            assert!(writer.finish(&mut stream).await.is_err());
        });
    }

    #[test]
    fn chunked_emits_size_prefixed_frames_and_terminator() {
        smol::block_on(async {
            let mut stream = SinkStream(Vec::new());
            let mut writer = BodyWriter::new(BodyKind::Chunked);
            writer.write(&mut stream, b"wiki").await.unwrap();
            writer.finish(&mut stream).await.unwrap();
            assert_eq!(stream.0, b"4\r\nwiki\r\n0\r\n\r\n");
        });
    }
}
