use smol::io::AsyncReadExt;

use super::{BodyKind, MAX_CHUNK_LINE_BYTES, MAX_TRAILER_BYTES, READ_CHUNK};
use crate::error::{Error, Result};
use crate::stream::AsyncStream;

/// Reads a single body off a stream according to its framing, preserving
/// across calls whatever header-parse spillover the connection already
/// buffered (`carry`).
pub struct BodyReader {
    kind: BodyKind,
    buf: Vec<u8>,
    remaining: u64,
    chunk_remaining: u64,
    done: bool,
    trailer_bytes: usize,
}

impl BodyReader {
    pub fn new(kind: BodyKind, carry: Vec<u8>) -> Self {
        let remaining = match kind {
            BodyKind::ContentLength(n) => n,
            _ => 0,
        };
        Self {
            kind,
            buf: carry,
            remaining,
            chunk_remaining: 0,
            done: matches!(kind, BodyKind::Empty),
            trailer_bytes: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Returns the next chunk of body bytes, or `None` once the body is
    /// fully consumed. An empty-but-not-`None` result never happens.
    pub async fn next_bytes(&mut self, stream: &mut dyn AsyncStream) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        match self.kind {
            BodyKind::Empty => {
                self.done = true;
                Ok(None)
            }
            BodyKind::ContentLength(_) => self.next_content_length(stream).await,
            BodyKind::Chunked => self.next_chunked(stream).await,
            BodyKind::Unknown => self.next_unknown(stream).await,
        }
    }

    /// Drains any remaining body bytes without returning them, for
    /// connection reuse after a handler ignores the request/response body.
    pub async fn drain(&mut self, stream: &mut dyn AsyncStream) -> Result<()> {
        while self.next_bytes(stream).await?.is_some() {}
        Ok(())
    }

    async fn next_content_length(
        &mut self,
        stream: &mut dyn AsyncStream,
    ) -> Result<Option<Vec<u8>>> {
        if self.remaining == 0 {
            self.done = true;
            return Ok(None);
        }
        if !self.buf.is_empty() {
            let n = (self.buf.len() as u64).min(self.remaining) as usize;
            let out = self.buf.drain(..n).collect::<Vec<u8>>();
            self.remaining -= n as u64;
            return Ok(Some(out));
        }
        let mut tmp = vec![0u8; READ_CHUNK];
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::UnexpectedEndOfStream);
        }
        let n = (n as u64).min(self.remaining) as usize;
        self.remaining -= n as u64;
        tmp.truncate(n);
        Ok(Some(tmp))
    }

    async fn next_unknown(&mut self, stream: &mut dyn AsyncStream) -> Result<Option<Vec<u8>>> {
        if !self.buf.is_empty() {
            return Ok(Some(std::mem::take(&mut self.buf)));
        }
        let mut tmp = vec![0u8; READ_CHUNK];
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            self.done = true;
            return Ok(None);
        }
        tmp.truncate(n);
        Ok(Some(tmp))
    }

    async fn next_chunked(&mut self, stream: &mut dyn AsyncStream) -> Result<Option<Vec<u8>>> {
        if self.chunk_remaining == 0 {
            let size = self.read_next_chunk_size(stream).await?;
            if size == 0 {
                self.consume_trailers(stream).await?;
                self.done = true;
                return Ok(None);
            }
            self.chunk_remaining = size;
        }

        self.ensure_buf_len(stream, self.chunk_remaining as usize + 2)
            .await?;

        let data: Vec<u8> = self.buf.drain(..self.chunk_remaining as usize).collect();
        self.chunk_remaining = 0;

        if self.buf.first() != Some(&b'\r') || self.buf.get(1) != Some(&b'\n') {
            return Err(Error::protocol_error(
                "invalid chunked encoding: missing CRLF after chunk data",
            ));
        }
        self.buf.drain(..2);

        Ok(Some(data))
    }

    async fn read_next_chunk_size(&mut self, stream: &mut dyn AsyncStream) -> Result<u64> {
        loop {
            match httparse::parse_chunk_size(&self.buf) {
                Ok(httparse::Status::Complete((consumed, size))) => {
                    self.buf.drain(..consumed);
                    return Ok(size);
                }
                Ok(httparse::Status::Partial) => {
                    if self.buf.len() > MAX_CHUNK_LINE_BYTES {
                        return Err(Error::protocol_error("chunk size line too large"));
                    }
                    self.read_more(stream).await?;
                }
                Err(_) => return Err(Error::protocol_error("invalid chunk size")),
            }
        }
    }

    async fn consume_trailers(&mut self, stream: &mut dyn AsyncStream) -> Result<()> {
        loop {
            if self.buf.first() == Some(&b'\r') && self.buf.get(1) == Some(&b'\n') {
                self.buf.drain(..2);
                return Ok(());
            }
            if let Some(pos) = find_subslice(&self.buf, b"\r\n\r\n") {
                self.buf.drain(..pos + 4);
                return Ok(());
            }
            if self.trailer_bytes > MAX_TRAILER_BYTES {
                return Err(Error::protocol_error("chunk trailers too large"));
            }
            let before = self.buf.len();
            self.read_more(stream).await?;
            self.trailer_bytes += self.buf.len().saturating_sub(before);
        }
    }

    async fn ensure_buf_len(&mut self, stream: &mut dyn AsyncStream, len: usize) -> Result<()> {
        while self.buf.len() < len {
            self.read_more(stream).await?;
        }
        Ok(())
    }

    async fn read_more(&mut self, stream: &mut dyn AsyncStream) -> Result<()> {
        let mut tmp = [0u8; READ_CHUNK];
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::UnexpectedEndOfStream);
        }
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(())
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::io::{AsyncRead, AsyncWrite};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct FakeStream {
        data: Vec<u8>,
        pos: usize,
    }

    impl FakeStream {
        fn new(data: &[u8]) -> Self {
            Self { data: data.to_vec(), pos: 0 }
        }
    }

    impl AsyncRead for FakeStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            let remaining = &this.data[this.pos..];
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            this.pos += n;
            Poll::Ready(Ok(n))
        }
    }

    impl AsyncWrite for FakeStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncStream for FakeStream {
        fn set_nodelay(&self, _nodelay: bool) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn content_length_drains_carry_then_stream() {
        smol::block_on(async {
            let mut stream = FakeStream::new(b"world");
            let mut reader = BodyReader::new(BodyKind::ContentLength(10), b"hello".to_vec());
            let mut collected = Vec::new();
            while let Some(chunk) = reader.next_bytes(&mut stream).await.unwrap() {
                collected.extend(chunk);
            }
            assert_eq!(collected, b"helloworld");
        });
    }

    #[test]
    fn chunked_reads_two_chunks_and_terminator() {
        smol::block_on(async {
            let mut stream = FakeStream::new(b"");
            let mut reader = BodyReader::new(
                BodyKind::Chunked,
                b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n".to_vec(),
            );
            let mut collected = Vec::new();
            while let Some(chunk) = reader.next_bytes(&mut stream).await.unwrap() {
                collected.extend(chunk);
            }
            assert_eq!(collected, b"wikipedia");
        });
    }

    #[test]
    fn empty_body_yields_nothing() {
        smol::block_on(async {
            let mut stream = FakeStream::new(b"");
            let mut reader = BodyReader::new(BodyKind::Empty, Vec::new());
            assert!(reader.next_bytes(&mut stream).await.unwrap().is_none());
        });
    }
}
