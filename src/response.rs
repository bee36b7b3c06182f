//! The incoming response a client request produces.

use std::sync::Arc;

use crate::body::BodyReader;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::pool::ConnectionPool;
use crate::stream::AsyncStream;

pub struct Response<S: AsyncStream> {
    conn: Option<Connection<S>>,
    reader: BodyReader,
    pool_return: Option<(Arc<ConnectionPool<S>>, String)>,
    pub status_code: u16,
    pub status_message: String,
    pub headers: Headers,
}

impl<S: AsyncStream> Response<S> {
    pub(crate) fn new(
        conn: Connection<S>,
        reader: BodyReader,
        status_code: u16,
        status_message: String,
        headers: Headers,
    ) -> Self {
        Self { conn: Some(conn), reader, pool_return: None, status_code, status_message, headers }
    }

    /// Marks this response's connection for return to `pool` under `key`
    /// once the body reaches end-of-stream, instead of being dropped —
    /// what lets a later independent call reuse it.
    pub(crate) fn return_to_pool(mut self, pool: Arc<ConnectionPool<S>>, key: String) -> Self {
        self.pool_return = Some((pool, key));
        self
    }

    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.as_mut().ok_or(Error::AlreadyClosed)?;
        let chunk = self.reader.next_bytes(conn.stream_mut()).await?;
        if chunk.is_none() {
            conn.reader_done();
            self.release_to_pool().await;
        }
        Ok(chunk)
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            out.extend(chunk);
        }
        Ok(out)
    }

    /// Consumes and discards the body without returning it, so the
    /// connection can be reused for the next exchange.
    pub async fn drain(&mut self) -> Result<()> {
        {
            let conn = self.conn.as_mut().ok_or(Error::AlreadyClosed)?;
            conn.drain(&mut self.reader).await?;
        }
        self.release_to_pool().await;
        Ok(())
    }

    /// Drains the body (if not already consumed) and returns the connection
    /// for reuse by the next request. Supersedes this response's own pool
    /// registration, if any — the caller is now responsible for the
    /// connection instead.
    pub async fn finish(mut self) -> Result<Connection<S>> {
        self.pool_return = None;
        if !self.reader.is_done() {
            self.drain().await?;
        }
        self.conn.take().ok_or(Error::AlreadyClosed)
    }

    /// Extracts the raw byte stream for a protocol switch (101 response),
    /// along with any bytes already buffered above it.
    pub fn detach(mut self) -> (S, Vec<u8>) {
        self.pool_return = None;
        self.conn.take().expect("detach called on an already-released response").detach()
    }

    async fn release_to_pool(&mut self) {
        if let Some((pool, key)) = self.pool_return.take() {
            if let Some(conn) = self.conn.take() {
                pool.checkin(key, conn).await;
            }
        }
    }
}
