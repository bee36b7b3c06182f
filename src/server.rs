//! Accept loop, bounded per-connection concurrency, `ResponseWriter`
//! contract, server-side WebSocket upgrade.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_lock::Semaphore;
use base64::Engine;
use chrono::Utc;
use mea::{condvar::Condvar, mutex::Mutex};
use sha1::{Digest, Sha1};
use smol::future;
use smol::net::{TcpListener, TcpStream};

use crate::body::{BodyKind, BodyReader, BodyWriter};
use crate::client::accept_key;
use crate::connection::{Connection, RequestHead, Role};
use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::method::Method;
use crate::request::Query;
use crate::status::reason_phrase;
use crate::stream::AsyncStream;
use crate::websocket::frame::Role as WsRole;
use crate::websocket::session::WebSocket;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A request the handler is invoked with: the parsed head plus a body
/// reader and the query object derived from the request-target.
pub struct Request {
    pub method: Method,
    pub path: String,
    pub headers: Headers,
    pub query: Query,
    reader: BodyReader,
}

impl Request {
    fn new(head: RequestHead, reader: BodyReader) -> Self {
        let query = Query::parse(&head.path);
        Self { method: head.method, path: head.path, headers: head.headers, query, reader }
    }

    pub async fn read_chunk(
        &mut self,
        conn: &mut Option<Connection<Box<dyn AsyncStream>>>,
    ) -> Result<Option<Vec<u8>>> {
        let conn = conn.as_mut().ok_or(Error::AlreadyClosed)?;
        let chunk = self.reader.next_bytes(conn.stream_mut()).await?;
        if chunk.is_none() {
            conn.reader_done();
        }
        Ok(chunk)
    }

    pub async fn read_to_end(
        &mut self,
        conn: &mut Option<Connection<Box<dyn AsyncStream>>>,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk(conn).await? {
            out.extend(chunk);
        }
        Ok(out)
    }

    pub fn is_body_consumed(&self) -> bool {
        self.reader.is_done()
    }
}

/// Commits a status line and headers exactly once, then accepts body
/// writes; mutating `headers` after the first write fails. Each method
/// borrows the connection only for the duration of the call, so a handler
/// can freely interleave reads from `Request` and writes through this type
/// on the same connection.
pub struct ResponseWriter {
    pub headers: Headers,
    committed: Option<(u16, BodyWriter)>,
    body_written: bool,
}

impl ResponseWriter {
    fn new() -> Self {
        Self { headers: Headers::new(), committed: None, body_written: false }
    }

    pub fn is_committed(&self) -> bool {
        self.committed.is_some()
    }

    pub fn committed_status(&self) -> Option<u16> {
        self.committed.as_ref().map(|(code, _)| *code)
    }

    /// Explicitly commits the status line and headers.
    pub async fn write_headers(
        &mut self,
        conn: &mut Option<Connection<Box<dyn AsyncStream>>>,
        code: u16,
        message: Option<&str>,
    ) -> Result<()> {
        if self.committed.is_some() {
            return Err(Error::HeadersAlreadyWritten);
        }
        let conn = conn.as_mut().ok_or(Error::AlreadyClosed)?;
        let message = message.map(str::to_string).unwrap_or_else(|| reason_phrase(code).to_string());
        let kind = if self.headers.contains("Content-Length") {
            let n: u64 = self
                .headers
                .single("Content-Length")
                .unwrap()
                .parse()
                .map_err(|_| Error::format_error("invalid Content-Length"))?;
            if n == 0 { BodyKind::Empty } else { BodyKind::ContentLength(n) }
        } else if code == 204 {
            BodyKind::Empty
        } else {
            BodyKind::Chunked
        };
        let writer = conn.send_headers(code, &message, &self.headers, kind, code == 101).await?;
        self.committed = Some((code, writer));
        Ok(())
    }

    /// Writes body bytes, implicitly committing with `200 OK` if nothing
    /// has been written yet.
    pub async fn write(
        &mut self,
        conn: &mut Option<Connection<Box<dyn AsyncStream>>>,
        data: &[u8],
    ) -> Result<()> {
        if self.committed.is_none() {
            self.write_headers(conn, 200, None).await?;
        }
        self.body_written = true;
        let (_, writer) = self.committed.as_mut().unwrap();
        let conn = conn.as_mut().ok_or(Error::AlreadyClosed)?;
        writer.write(conn.stream_mut(), data).await
    }

    pub async fn redirect(
        &mut self,
        conn: &mut Option<Connection<Box<dyn AsyncStream>>>,
        code: u16,
        location: &str,
        message: Option<&str>,
    ) -> Result<()> {
        self.headers.set("Location", location);
        self.write_headers(conn, code, message).await
    }

    /// Finalizes the response, reporting whether the declared Content-Length
    /// was fully satisfied (the server loop hard-closes the connection when
    /// it was not).
    pub async fn close(mut self, conn: &mut Option<Connection<Box<dyn AsyncStream>>>) -> Result<bool> {
        if self.committed.is_none() {
            self.headers.set("Content-Length", "0");
            self.write_headers(conn, 500, Some("Internal Server Error")).await?;
        }
        let (_, mut writer) = self.committed.take().unwrap();
        let conn = conn.as_mut().ok_or(Error::AlreadyClosed)?;
        let ok = conn.finish_writer(&mut writer).await.is_ok();
        Ok(ok)
    }

    pub fn wrote_anything(&self) -> bool {
        self.body_written
    }
}

type HandleFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Application handler. An `Err` return plays the role of an uncaught
/// exception (spec §4.6): if no headers were sent yet the server loop
/// reports 500 with the error text, otherwise it RST-closes the
/// connection since the peer may already be mid-body.
///
/// `conn` is an `Option` rather than a bare `&mut Connection` so a handler
/// performing a protocol upgrade (`Server::web_socket`) can `.take()` the
/// connection by value to detach its stream. Leaving `None` behind tells
/// the server loop the handler took ownership and it must not touch the
/// connection again.
pub trait Handler: Send + Sync {
    fn handle<'a>(
        &'a self,
        request: &'a mut Request,
        writer: &'a mut ResponseWriter,
        conn: &'a mut Option<Connection<Box<dyn AsyncStream>>>,
        peer: SocketAddr,
    ) -> HandleFuture<'a>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(
            &'a mut Request,
            &'a mut ResponseWriter,
            &'a mut Option<Connection<Box<dyn AsyncStream>>>,
            SocketAddr,
        ) -> HandleFuture<'a>
        + Send
        + Sync,
{
    fn handle<'a>(
        &'a self,
        request: &'a mut Request,
        writer: &'a mut ResponseWriter,
        conn: &'a mut Option<Connection<Box<dyn AsyncStream>>>,
        peer: SocketAddr,
    ) -> HandleFuture<'a> {
        self(request, writer, conn, peer)
    }
}

#[derive(Clone)]
pub struct GracefulShutdown {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    shutting_down: AtomicBool,
    inflight: AtomicU64,
    gate: Mutex<()>,
    cv: Condvar,
}

pub struct InflightGuard {
    inner: Arc<ShutdownInner>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.inner.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.cv.notify_all();
        }
    }
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                shutting_down: AtomicBool::new(false),
                inflight: AtomicU64::new(0),
                gate: Mutex::new(()),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn initiate(&self) {
        if self.inner.shutting_down.swap(true, Ordering::Release) {
            return;
        }
        self.inner.cv.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    pub async fn wait_shutting_down(&self) {
        if self.is_shutting_down() {
            return;
        }
        let mut guard = self.inner.gate.lock().await;
        while !self.is_shutting_down() {
            guard = self.inner.cv.wait(guard).await;
        }
    }

    fn inflight_guard(&self) -> InflightGuard {
        self.inner.inflight.fetch_add(1, Ordering::Relaxed);
        InflightGuard { inner: self.inner.clone() }
    }

    pub async fn wait_inflight_zero(&self) {
        if self.inner.inflight.load(Ordering::Acquire) == 0 {
            return;
        }
        let mut guard = self.inner.gate.lock().await;
        while self.inner.inflight.load(Ordering::Acquire) != 0 {
            guard = self.inner.cv.wait(guard).await;
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Server {
    pub read_timeout: Duration,
    max_tasks: usize,
    tasks: Arc<Semaphore>,
    shutdown: GracefulShutdown,
}

impl Server {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_tasks,
            tasks: Arc::new(Semaphore::new(max_tasks)),
            shutdown: GracefulShutdown::new(),
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn shutdown_handle(&self) -> GracefulShutdown {
        self.shutdown.clone()
    }

    /// Runs the accept loop until shutdown is initiated, then waits for
    /// in-flight handlers to finish.
    pub async fn listen<H: Handler + 'static>(&self, listener: TcpListener, handler: Arc<H>) -> Result<()> {
        loop {
            let Some((stream, peer)) = accept_or_shutdown(&listener, &self.shutdown).await? else {
                break;
            };

            if self.max_tasks == 1 {
                let _permit = self.tasks.acquire().await;
                let _guard = self.shutdown.inflight_guard();
                self.serve_connection(stream, peer, handler.clone()).await;
                continue;
            }

            let permit = self.tasks.clone().acquire_arc().await;
            let guard = self.shutdown.inflight_guard();
            let handler = handler.clone();
            let read_timeout = self.read_timeout;
            smol::spawn(async move {
                serve_connection_standalone(stream, peer, handler, read_timeout).await;
                drop(permit);
                drop(guard);
            })
            .detach();
        }

        self.shutdown.wait_inflight_zero().await;
        Ok(())
    }

    async fn serve_connection<H: Handler>(&self, stream: TcpStream, peer: SocketAddr, handler: Arc<H>) {
        serve_connection_standalone(stream, peer, handler, self.read_timeout).await;
    }

    /// Validates and completes a server-side RFC 6455 upgrade for `request`,
    /// writing the 101 response and detaching the connection's stream.
    pub async fn web_socket(
        &self,
        request: &Request,
        conn: Connection<Box<dyn AsyncStream>>,
    ) -> Result<WebSocket<Box<dyn AsyncStream>>> {
        let key = request
            .headers
            .single("Sec-WebSocket-Key")
            .ok_or_else(|| Error::protocol_error("missing Sec-WebSocket-Key"))?;
        if key.len() != 24 {
            return Err(Error::protocol_error("Sec-WebSocket-Key must be 24 characters"));
        }
        if !request.headers.matches("Connection", "Upgrade")
            || !request.headers.matches("Upgrade", "websocket")
            || !request.headers.matches("Sec-WebSocket-Version", "13")
        {
            return Err(Error::protocol_error("missing or invalid upgrade headers"));
        }

        let accept = accept_key(key);
        let mut conn = conn;
        let mut headers = Headers::new();
        headers.set("Upgrade", "websocket");
        headers.set("Connection", "Upgrade");
        headers.set("Sec-WebSocket-Accept", accept);
        let mut writer = conn.send_headers(101, "Switching Protocols", &headers, BodyKind::Empty, true).await?;
        conn.finish_writer(&mut writer).await?;

        let (stream, carry) = conn.detach();
        Ok(WebSocket::new(stream, carry, WsRole::Server))
    }
}

async fn accept_or_shutdown(
    listener: &TcpListener,
    shutdown: &GracefulShutdown,
) -> std::io::Result<Option<(TcpStream, SocketAddr)>> {
    let accept_fut = async { listener.accept().await.map(Some) };
    let shutdown_fut = async {
        shutdown.wait_shutting_down().await;
        Ok(None)
    };
    future::or(accept_fut, shutdown_fut).await
}

async fn serve_connection_standalone<H: Handler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    read_timeout: Duration,
) {
    let stream: Box<dyn AsyncStream> = Box::new(stream);
    let mut conn = Connection::new(stream, Role::Server, None);
    let started_at = Instant::now();
    let mut count: u64 = 0;

    loop {
        let read_result = future::or(
            async { conn.read_request().await.map(Some) },
            async {
                smol::Timer::after(read_timeout).await;
                Ok(None)
            },
        )
        .await;

        let (head, reader) = match read_result {
            Ok(Some(Some((head, reader)))) => (head, reader),
            Ok(Some(None)) => break,
            Ok(None) => {
                log::debug!("peer={peer} read timed out");
                break;
            }
            Err(e) if e.is_close_exception() => {
                log::debug!("peer={peer} closed: {e}");
                break;
            }
            Err(e) => {
                log::warn!("peer={peer} error reading request: {e}");
                break;
            }
        };

        if matches!(head.method, Method::Head) {
            let mut writer = ResponseWriter::new();
            writer.headers.set("Allow", "GET, HEAD, PUT, POST");
            let mut slot = Some(conn);
            let _ = writer.write_headers(&mut slot, 405, Some("HEAD not implemented")).await;
            let _ = writer.close(&mut slot).await;
            conn = slot.expect("built-in responses never detach the connection");
            count += 1;
            log_exchange(peer, &head.method, &head.path, 405, count, started_at);
            continue;
        }

        let method = head.method.clone();
        let path = head.path.clone();
        let mut request = Request::new(head, reader);
        let mut writer = ResponseWriter::new();

        let mut slot = Some(conn);
        let outcome = handler.handle(&mut request, &mut writer, &mut slot, peer).await;

        let Some(reclaimed) = slot else {
            // The handler took ownership of the connection (a protocol
            // upgrade such as WebSocket). It now drives the stream itself;
            // this loop has nothing left to do.
            log::info!("peer={peer} connection handed off to a protocol upgrade");
            return;
        };
        conn = reclaimed;
        let mut slot = Some(conn);

        if let Err(e) = outcome {
            if writer.is_committed() {
                log::warn!("peer={peer} handler error after headers sent, hard-closing: {e}");
                conn = slot.expect("not detached");
                let _ = conn.close_write().await;
                return;
            }
            log::warn!("peer={peer} handler error: {e}");
            let _ = writer.write_headers(&mut slot, 500, Some(&e.to_string())).await;
            let _ = writer.write(&mut slot, e.to_string().as_bytes()).await;
        }

        let status = writer.committed_status().unwrap_or(500);
        let body_ok = match writer.close(&mut slot).await {
            Ok(ok) => ok,
            Err(_) => false,
        };
        conn = slot.expect("not detached");

        if !body_ok || !request.is_body_consumed() {
            log::warn!("peer={peer} closing connection: incomplete body framing");
            break;
        }

        count += 1;
        log_exchange(peer, &method, &path, status, count, started_at);

        if !conn.is_reusable() {
            break;
        }
    }

    let _ = conn.close_write().await;
}

fn log_exchange(peer: SocketAddr, method: &Method, path: &str, status: u16, count: u64, started_at: Instant) {
    let elapsed = started_at.elapsed().as_secs_f64();
    let qps = if elapsed > 0.0 { count as f64 / elapsed } else { 0.0 };
    log::info!(
        "{} peer={} method={} path={} status={} count={} qps={:.2}",
        Utc::now().to_rfc3339(),
        peer,
        method,
        path,
        status,
        count,
        qps
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_gate_releases_after_initiate() {
        smol::block_on(async {
            let shutdown = GracefulShutdown::new();
            assert!(!shutdown.is_shutting_down());
            shutdown.initiate();
            shutdown.wait_shutting_down().await;
            assert!(shutdown.is_shutting_down());
        });
    }

    #[test]
    fn inflight_guard_tracks_outstanding_work() {
        smol::block_on(async {
            let shutdown = GracefulShutdown::new();
            let guard = shutdown.inflight_guard();
            drop(guard);
            shutdown.wait_inflight_zero().await;
        });
    }
}
