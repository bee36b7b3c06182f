//! Connection factory, redirect loop, convenience verbs, client-side
//! WebSocket upgrade.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};
use smol::net::TcpStream;

use crate::body::BodyKind;
use crate::connection::{Connection, Role};
use crate::encoding::{encode_form, encode_json};
use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::method::Method;
use crate::pool::ConnectionPool;
use crate::response::Response;
use crate::security::SecurityStore;
use crate::status::{is_redirect, is_see_other};
use crate::stream::AsyncStream;
use crate::uri::ParsedUri;
use crate::websocket::session::WebSocket;
use serde::Serialize;

pub const MAX_REDIRECTS: u32 = 20;
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Payload headers stripped when a 303 rewrites a request to GET.
const PAYLOAD_HEADERS: &[&str] = &[
    "Content-Length",
    "Content-Type",
    "Content-Encoding",
    "Content-Language",
    "Content-Location",
    "Transfer-Encoding",
];

type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<Box<dyn AsyncStream>>> + 'a>>;

/// How the client obtains a byte stream for a host/port. The default plain
/// connector refuses TLS; callers that need `https`/`wss` supply their own
/// implementation wrapping whatever TLS crate they use.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, host: &'a str, port: u16, use_tls: bool) -> ConnectFuture<'a>;
}

pub struct PlainConnector;

impl Connector for PlainConnector {
    fn connect<'a>(&'a self, host: &'a str, port: u16, use_tls: bool) -> ConnectFuture<'a> {
        Box::pin(async move {
            if use_tls {
                return Err(Error::invalid_argument(
                    "PlainConnector cannot establish a TLS connection; supply a TLS-aware Connector",
                ));
            }
            let stream = TcpStream::connect((host, port)).await?;
            Ok(Box::new(stream) as Box<dyn AsyncStream>)
        })
    }
}

pub struct Client<C: Connector = PlainConnector> {
    connector: C,
    security_store: Option<Arc<dyn SecurityStore>>,
    pool: Arc<ConnectionPool<Box<dyn AsyncStream>>>,
}

impl Client<PlainConnector> {
    pub fn new() -> Self {
        Self { connector: PlainConnector, security_store: None, pool: Arc::new(ConnectionPool::new()) }
    }
}

impl Default for Client<PlainConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> Client<C> {
    pub fn with_connector(connector: C) -> Self {
        Self { connector, security_store: None, pool: Arc::new(ConnectionPool::new()) }
    }

    pub fn with_security_store(mut self, store: Arc<dyn SecurityStore>) -> Self {
        self.security_store = Some(store);
        self
    }

    /// Opens a fresh connection to `host`, honoring an embedded `:port`
    /// suffix (conflicting with an explicit `port` is an argument error).
    /// Always dials; callers after a pooled connection should go through
    /// `get`/`post`/`execute` instead, which check the idle pool first.
    pub async fn new_connection(
        &self,
        host: &str,
        port: Option<u16>,
        use_tls: bool,
    ) -> Result<Connection<Box<dyn AsyncStream>>> {
        let (host, resolved_port) = resolve_host_port(host, port, use_tls)?;
        self.dial(&host, resolved_port, use_tls).await
    }

    async fn dial(&self, host: &str, port: u16, use_tls: bool) -> Result<Connection<Box<dyn AsyncStream>>> {
        let session_key = format!("{host}:{port}");
        if let Some(store) = &self.security_store {
            let _prior_session = store.get(&session_key);
        }
        let stream = self.connector.connect(host, port, use_tls).await?;
        if let Some(store) = &self.security_store {
            store.put(session_key, Vec::new());
        }

        let host_header = if port == if use_tls { 443 } else { 80 } {
            host.to_string()
        } else {
            format!("{host}:{port}")
        };
        Ok(Connection::new(stream, Role::Client, Some(host_header)))
    }

    pub async fn get(&self, uri: &str) -> Result<Response<Box<dyn AsyncStream>>> {
        self.execute(Method::Get, uri, Headers::new(), None).await
    }

    pub async fn post(&self, uri: &str, body: Vec<u8>) -> Result<Response<Box<dyn AsyncStream>>> {
        self.execute(Method::Post, uri, Headers::new(), Some(body)).await
    }

    pub async fn post_json<T: Serialize>(
        &self,
        uri: &str,
        value: &T,
    ) -> Result<Response<Box<dyn AsyncStream>>> {
        let mut headers = Headers::new();
        if headers.contains("Content-Type") {
            return Err(Error::invalid_argument("Content-Type already set"));
        }
        headers.set("Content-Type", "application/json");
        let body = encode_json(value)?;
        self.execute(Method::Post, uri, headers, Some(body)).await
    }

    pub async fn post_form(
        &self,
        uri: &str,
        pairs: &[(&str, &str)],
    ) -> Result<Response<Box<dyn AsyncStream>>> {
        let mut headers = Headers::new();
        headers.set("Content-Type", "application/x-www-form-urlencoded");
        let body = encode_form(pairs).into_bytes();
        self.execute(Method::Post, uri, headers, Some(body)).await
    }

    /// Builds and sends one request, then follows 3xx redirects up to
    /// `MAX_REDIRECTS`, per spec: same-method for 301/302/307/308, GET
    /// rewrite (with payload headers stripped) for 303. Each hop first
    /// checks the idle-connection pool for its origin before dialing, and
    /// the returned response hands its connection back to the pool once its
    /// body is fully read — that's what lets a second, independent call to
    /// the same origin reuse the connection instead of dialing again.
    async fn execute(
        &self,
        method: Method,
        uri: &str,
        headers: Headers,
        body: Option<Vec<u8>>,
    ) -> Result<Response<Box<dyn AsyncStream>>> {
        if headers.contains("Host") || headers.contains("Transfer-Encoding") {
            return Err(Error::invalid_argument(
                "Host and Transfer-Encoding are set by the connection, not the caller",
            ));
        }

        let mut current_method = method;
        let mut current_headers = headers;
        let mut current_body = body;
        let mut current_uri = ParsedUri::parse(uri)?;
        let mut budget = MAX_REDIRECTS;

        loop {
            let key = pool_key(current_uri.use_tls, &current_uri.host, current_uri.port);
            let conn = match self.pool.checkout(&key).await {
                Some(conn) => conn,
                None => self.dial(&current_uri.host, current_uri.port, current_uri.use_tls).await?,
            };
            let response = self
                .send_once(conn, &current_method, &current_uri.path, &current_headers, current_body.clone())
                .await?;
            let response = response.return_to_pool(self.pool.clone(), key.clone());

            if !is_redirect(response.status_code) {
                return Ok(response);
            }
            if budget == 0 {
                return Err(Error::TooManyRedirects);
            }
            budget -= 1;

            let status_code = response.status_code;
            let location = response
                .headers
                .single("Location")
                .ok_or_else(|| Error::invalid_redirect("redirect response missing Location"))?
                .to_string();
            current_uri = current_uri.resolve(&location)?;
            let conn = response.finish().await?;
            self.pool.checkin(key, conn).await;

            if is_see_other(status_code) {
                current_method = Method::Get;
                current_body = None;
                for name in PAYLOAD_HEADERS {
                    current_headers.remove(name);
                }
            }
        }
    }

    async fn send_once(
        &self,
        mut conn: Connection<Box<dyn AsyncStream>>,
        method: &Method,
        path: &str,
        headers: &Headers,
        body: Option<Vec<u8>>,
    ) -> Result<Response<Box<dyn AsyncStream>>> {
        let body_kind = match &body {
            None => BodyKind::Empty,
            Some(b) if method.allows_request_body() => BodyKind::ContentLength(b.len() as u64),
            Some(_) => BodyKind::Empty,
        };
        let mut writer = conn.new_request(method, path, headers, body_kind).await?;
        if let Some(data) = &body {
            writer.write(conn.stream_mut(), data).await?;
        }
        conn.finish_writer(&mut writer).await?;

        let method_was_head = matches!(method, Method::Head);
        let (head, reader) = conn.read_response(method_was_head).await?;
        Ok(Response::new(conn, reader, head.status_code, head.status_message, head.headers))
    }

    /// Issues the RFC 6455 upgrade handshake and returns a client-role
    /// WebSocket session on success.
    pub async fn web_socket(&self, uri: &str) -> Result<WebSocket<Box<dyn AsyncStream>>> {
        let parsed = ParsedUri::parse(uri)?;
        let mut conn = self.new_connection(&parsed.host, Some(parsed.port), parsed.use_tls).await?;

        let mut nonce_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = base64::engine::general_purpose::STANDARD.encode(nonce_bytes);

        let mut headers = Headers::new();
        headers.set("Connection", "Upgrade");
        headers.set("Upgrade", "websocket");
        headers.set("Sec-WebSocket-Version", "13");
        headers.set("Sec-WebSocket-Key", &nonce);

        let mut writer = conn.new_request(&Method::Get, &parsed.path, &headers, BodyKind::Empty).await?;
        conn.finish_writer(&mut writer).await?;

        let (head, reader) = conn.read_response(false).await?;
        if head.status_code != 101 {
            return Err(Error::protocol_error(format!(
                "websocket upgrade failed with status {}",
                head.status_code
            )));
        }
        if !head.headers.matches("Upgrade", "websocket") || !head.headers.matches("Connection", "Upgrade") {
            return Err(Error::protocol_error("upgrade response missing Upgrade/Connection headers"));
        }
        if head.headers.contains("Sec-WebSocket-Extensions") || head.headers.contains("Sec-WebSocket-Protocol") {
            return Err(Error::protocol_error(
                "server negotiated an extension or subprotocol this core does not support",
            ));
        }
        let accept = head
            .headers
            .single("Sec-WebSocket-Accept")
            .ok_or_else(|| Error::MissingHeaderInResponse("Sec-WebSocket-Accept".to_string()))?;
        let expected = accept_key(&nonce);
        if accept != expected {
            return Err(Error::protocol_error("Sec-WebSocket-Accept does not match expected value"));
        }

        let response = Response::new(conn, reader, head.status_code, head.status_message, head.headers);
        let (stream, carry) = response.detach();
        Ok(WebSocket::new(stream, carry, crate::websocket::frame::Role::Client))
    }
}

/// Splits an embedded `host:port` suffix out of `host` (a single embedded
/// colon; an IPv6 literal has more than one and is passed through
/// untouched), reconciling it with an explicit `port` when both are given.
fn resolve_host_port(host: &str, port: Option<u16>, use_tls: bool) -> Result<(String, u16)> {
    let (host, embedded_port) = if host.matches(':').count() == 1 {
        match host.rsplit_once(':') {
            Some((h, p)) => match p.parse::<u16>() {
                Ok(p) => (h, Some(p)),
                Err(_) => (host, None),
            },
            None => (host, None),
        }
    } else {
        (host, None)
    };
    let resolved_port = match (port, embedded_port) {
        (Some(a), Some(b)) if a != b => {
            return Err(Error::invalid_argument(format!(
                "conflicting ports: explicit {a} vs embedded {b}"
            )));
        }
        (Some(a), _) => a,
        (None, Some(b)) => b,
        (None, None) => if use_tls { 443 } else { 80 },
    };
    Ok((host.to_string(), resolved_port))
}

/// Idle-pool key for an origin: distinct from the security-store's
/// `host:port` key since it must also distinguish plain from TLS.
fn pool_key(use_tls: bool, host: &str, port: u16) -> String {
    format!("{}:{host}:{port}", if use_tls { "tls" } else { "plain" })
}

pub fn accept_key(nonce: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_worked_example() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    use smol::io::{AsyncRead, AsyncWrite};

    struct FixedStream {
        inbound: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for FixedStream {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            let remaining = &this.inbound[this.pos..];
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            this.pos += n;
            Poll::Ready(Ok(n))
        }
    }

    impl AsyncWrite for FixedStream {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncStream for FixedStream {
        fn set_nodelay(&self, _nodelay: bool) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// A connector whose stream already holds two back-to-back keep-alive
    /// responses, so a second `get()` only needs a fresh dial if the pool
    /// failed to hand back the first connection.
    struct CountingConnector {
        dials: Arc<AtomicUsize>,
    }

    impl Connector for CountingConnector {
        fn connect<'a>(&'a self, _host: &'a str, _port: u16, _use_tls: bool) -> ConnectFuture<'a> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let one = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec();
                let mut inbound = one.clone();
                inbound.extend(one);
                Ok(Box::new(FixedStream { inbound, pos: 0 }) as Box<dyn AsyncStream>)
            })
        }
    }

    #[test]
    fn second_get_to_same_origin_reuses_the_pooled_connection() {
        smol::block_on(async {
            let dials = Arc::new(AtomicUsize::new(0));
            let client = Client::with_connector(CountingConnector { dials: dials.clone() });

            let mut first = client.get("http://example.test/a").await.unwrap();
            assert_eq!(first.read_to_end().await.unwrap(), b"ok");

            let mut second = client.get("http://example.test/a").await.unwrap();
            assert_eq!(second.read_to_end().await.unwrap(), b"ok");

            assert_eq!(dials.load(Ordering::SeqCst), 1);
        });
    }
}
