//! The HTTP/1.1 protocol engine: one TCP byte stream, a strict sequence of
//! request/response exchanges, keep-alive and body-framing discipline.

use smol::io::{AsyncReadExt, AsyncWriteExt};

use crate::body::{BodyKind, BodyReader, BodyWriter};
use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::method::Method;
use crate::stream::AsyncStream;

const MAX_HEADER_BYTES: usize = 32 * 1024;
const MAX_HEADER_COUNT: usize = 64;

pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub headers: Headers,
}

pub struct ResponseHead {
    pub status_code: u16,
    pub status_message: String,
    pub headers: Headers,
}

/// Which side of the exchange a `Connection` is currently playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

pub struct Connection<S: AsyncStream> {
    stream: S,
    carry: Vec<u8>,
    role: Role,
    host_header: Option<String>,
    has_reader: bool,
    has_writer: bool,
    write_closed: bool,
}

impl<S: AsyncStream> Connection<S> {
    pub fn new(stream: S, role: Role, host_header: Option<String>) -> Self {
        Self {
            stream,
            carry: Vec::new(),
            role,
            host_header,
            has_reader: false,
            has_writer: false,
            write_closed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn require_slots_free(&self) -> Result<()> {
        if self.has_reader || self.has_writer {
            return Err(Error::PreviousRequestNotCompleted);
        }
        Ok(())
    }

    /// Client-side: writes the request line, headers, and (when selected)
    /// `Transfer-Encoding: chunked`, returning a body writer for the payload.
    pub async fn new_request(
        &mut self,
        method: &Method,
        path: &str,
        headers: &Headers,
        body_kind: BodyKind,
    ) -> Result<BodyWriter> {
        self.require_slots_free()?;
        if headers.contains("Host") {
            return Err(Error::invalid_argument("caller must not set Host directly"));
        }
        if headers.contains("Transfer-Encoding") {
            return Err(Error::invalid_argument(
                "caller must not set Transfer-Encoding directly",
            ));
        }

        self.stream.set_nodelay(true)?;

        let mut head = format!("{method} {path} HTTP/1.1\r\n");
        headers.write_to(&mut head);
        if let Some(host) = &self.host_header {
            head.push_str(&format!("Host: {host}\r\n"));
        }
        match body_kind {
            BodyKind::Chunked => head.push_str("Transfer-Encoding: chunked\r\n"),
            BodyKind::ContentLength(n) => head.push_str(&format!("Content-Length: {n}\r\n")),
            _ => {}
        }
        head.push_str("\r\n");

        self.stream.write_all(head.as_bytes()).await?;
        self.stream.set_nodelay(false)?;

        self.has_writer = true;
        Ok(BodyWriter::new(body_kind))
    }

    /// Server-side: writes the status line, headers, and framing header,
    /// returning a body writer for the payload.
    pub async fn send_headers(
        &mut self,
        status_code: u16,
        status_message: &str,
        headers: &Headers,
        body_kind: BodyKind,
        is_upgrade: bool,
    ) -> Result<BodyWriter> {
        self.require_slots_free()?;

        self.stream.set_nodelay(true)?;

        let mut head = format!("HTTP/1.1 {status_code} {status_message}\r\n");
        headers.write_to(&mut head);
        match body_kind {
            BodyKind::Chunked => head.push_str("Transfer-Encoding: chunked\r\n"),
            BodyKind::ContentLength(n) => head.push_str(&format!("Content-Length: {n}\r\n")),
            BodyKind::Empty if !is_upgrade => head.push_str("Content-Length: 0\r\n"),
            _ => {}
        }
        head.push_str("\r\n");

        self.stream.write_all(head.as_bytes()).await?;
        self.stream.set_nodelay(false)?;

        self.has_writer = true;
        Ok(BodyWriter::new(body_kind))
    }

    /// Reads bytes into `carry` until the header block (`\r\n\r\n`) is
    /// complete, returning the header-block length. `None` means the peer
    /// closed cleanly before sending anything.
    async fn read_head(&mut self) -> Result<Option<usize>> {
        let mut tmp = [0u8; 4096];
        loop {
            if let Some(pos) = find_subslice(&self.carry, b"\r\n\r\n") {
                return Ok(Some(pos + 4));
            }
            if self.carry.len() > MAX_HEADER_BYTES {
                return Err(Error::format_error("request/response headers too large"));
            }
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                if self.carry.is_empty() {
                    return Ok(None);
                }
                return Err(Error::UnexpectedEndOfStream);
            }
            self.carry.extend_from_slice(&tmp[..n]);
        }
    }

    fn reader_body_kind(
        &self,
        headers: &Headers,
        is_request: bool,
        method_was_head: bool,
        status_code: Option<u16>,
    ) -> Result<BodyKind> {
        if let Some(cl) = headers.single("Content-Length") {
            let n: u64 = cl
                .trim()
                .parse()
                .map_err(|_| Error::format_error(format!("invalid Content-Length: {cl}")))?;
            return Ok(if n == 0 { BodyKind::Empty } else { BodyKind::ContentLength(n) });
        }
        if headers.matches("Transfer-Encoding", "chunked") {
            return Ok(BodyKind::Chunked);
        }
        let no_body_status = matches!(status_code, Some(204) | Some(304));
        if is_request || no_body_status || method_was_head {
            return Ok(BodyKind::Empty);
        }
        Ok(BodyKind::Unknown)
    }

    /// Client-side: parses a response start line + headers.
    pub async fn read_response(&mut self, method_was_head: bool) -> Result<(ResponseHead, BodyReader)> {
        self.require_reader_free()?;
        let head_len = self
            .read_head()
            .await?
            .ok_or(Error::UnexpectedEndOfStream)?;
        let head_bytes = self.carry[..head_len].to_vec();
        self.carry.drain(..head_len);

        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        let mut resp = httparse::Response::new(&mut header_storage);
        match resp.parse(&head_bytes) {
            Ok(httparse::Status::Complete(_)) => {}
            _ => return Err(Error::format_error("malformed status line")),
        }
        let status_code = resp.code.ok_or_else(|| Error::format_error("missing status code"))?;
        let status_message = resp.reason.unwrap_or("").to_string();
        let headers = Headers::parse_lines(resp.headers)?;

        let kind = self.reader_body_kind(&headers, false, method_was_head, Some(status_code))?;
        self.has_reader = !matches!(kind, BodyKind::Empty);
        let carry = std::mem::take(&mut self.carry);
        Ok((ResponseHead { status_code, status_message, headers }, BodyReader::new(kind, carry)))
    }

    /// Server-side: parses a request start line + headers, or `None` on a
    /// clean EOF before any bytes arrive.
    pub async fn read_request(&mut self) -> Result<Option<(RequestHead, BodyReader)>> {
        self.require_reader_free()?;
        let head_len = match self.read_head().await? {
            Some(n) => n,
            None => return Ok(None),
        };
        let head_bytes = self.carry[..head_len].to_vec();
        self.carry.drain(..head_len);

        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        let mut req = httparse::Request::new(&mut header_storage);
        match req.parse(&head_bytes) {
            Ok(httparse::Status::Complete(_)) => {}
            _ => return Err(Error::format_error("malformed request line")),
        }
        let method_str = req.method.ok_or_else(|| Error::format_error("missing method"))?;
        let method: Method = method_str.parse()?;
        let path = req.path.ok_or_else(|| Error::format_error("missing path"))?.to_string();
        let headers = Headers::parse_lines(req.headers)?;

        let kind = self.reader_body_kind(&headers, true, false, None)?;
        self.has_reader = !matches!(kind, BodyKind::Empty);
        let carry = std::mem::take(&mut self.carry);
        Ok(Some((RequestHead { method: method.clone(), path, headers }, BodyReader::new(kind, carry))))
    }

    fn require_reader_free(&self) -> Result<()> {
        if self.has_reader {
            return Err(Error::PreviousReaderNotFinished);
        }
        Ok(())
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub async fn drain(&mut self, reader: &mut BodyReader) -> Result<()> {
        reader.drain(&mut self.stream).await?;
        self.reader_done();
        Ok(())
    }

    pub async fn finish_writer(&mut self, writer: &mut BodyWriter) -> Result<()> {
        writer.finish(&mut self.stream).await?;
        self.writer_done();
        Ok(())
    }

    pub fn reader_done(&mut self) {
        self.has_reader = false;
    }

    pub fn writer_done(&mut self) {
        self.has_writer = false;
    }

    pub fn is_reusable(&self) -> bool {
        !self.has_reader && !self.has_writer && !self.write_closed
    }

    /// Half-closes the write side if a reader is still active (peer may
    /// still be sending), otherwise fully closes the stream.
    pub async fn close_write(&mut self) -> Result<()> {
        self.write_closed = true;
        if !self.has_reader {
            self.stream.close().await?;
        }
        Ok(())
    }

    /// Hands ownership of the stream and any still-buffered bytes to a
    /// higher-layer protocol (the WebSocket engine) after a 101 response.
    pub fn detach(self) -> (S, Vec<u8>) {
        (self.stream, self.carry)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::io::{AsyncRead, AsyncWrite};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct LoopStream {
        inbound: Vec<u8>,
        pos: usize,
        outbound: Vec<u8>,
    }

    impl LoopStream {
        fn new(inbound: &[u8]) -> Self {
            Self { inbound: inbound.to_vec(), pos: 0, outbound: Vec::new() }
        }
    }

    impl AsyncRead for LoopStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            let remaining = &this.inbound[this.pos..];
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            this.pos += n;
            Poll::Ready(Ok(n))
        }
    }

    impl AsyncWrite for LoopStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.get_mut().outbound.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncStream for LoopStream {
        fn set_nodelay(&self, _nodelay: bool) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn client_writes_request_line_and_host() {
        smol::block_on(async {
            let mut conn = Connection::new(
                LoopStream::new(b""),
                Role::Client,
                Some("example.com".to_string()),
            );
            let mut headers = Headers::new();
            headers.set("Accept", "*/*");
            let mut writer = conn
                .new_request(&Method::Get, "/x", &headers, BodyKind::Empty)
                .await
                .unwrap();
            conn.finish_writer(&mut writer).await.unwrap();
            let out = String::from_utf8(conn.stream_mut().outbound.clone()).unwrap();
            assert!(out.starts_with("GET /x HTTP/1.1\r\n"));
            assert!(out.contains("Host: example.com\r\n"));
        });
    }

    #[test]
    fn rejects_second_request_before_first_completes() {
        smol::block_on(async {
            let mut conn = Connection::new(LoopStream::new(b""), Role::Client, None);
            let headers = Headers::new();
            let _writer = conn
                .new_request(&Method::Get, "/", &headers, BodyKind::Empty)
                .await
                .unwrap();
            let err = conn
                .new_request(&Method::Get, "/", &headers, BodyKind::Empty)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::PreviousRequestNotCompleted));
        });
    }

    #[test]
    fn reads_response_with_content_length() {
        smol::block_on(async {
            let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
            let mut conn = Connection::new(LoopStream::new(raw), Role::Client, None);
            let (head, mut reader) = conn.read_response(false).await.unwrap();
            assert_eq!(head.status_code, 200);
            let mut body = Vec::new();
            while let Some(chunk) = reader.next_bytes(conn.stream_mut()).await.unwrap() {
                body.extend(chunk);
            }
            assert_eq!(body, b"hello");
        });
    }

    #[test]
    fn rejects_caller_supplied_host_header() {
        smol::block_on(async {
            let mut conn = Connection::new(LoopStream::new(b""), Role::Client, None);
            let mut headers = Headers::new();
            headers.set("Host", "evil.example");
            let err = conn
                .new_request(&Method::Get, "/", &headers, BodyKind::Empty)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        });
    }

    #[test]
    fn malformed_header_line_is_format_error() {
        smol::block_on(async {
            let raw = b"GET / HTTP/1.1\r\nBad Header\r\n\r\n";
            let mut conn = Connection::new(LoopStream::new(raw), Role::Server, None);
            let err = conn.read_request().await.unwrap_err();
            assert!(matches!(err, Error::FormatError(_)));
        });
    }
}
