//! Message-level WebSocket session built on top of the frame codec.

use std::sync::Arc;

use async_lock::{Semaphore, SemaphoreGuardArc};
use smol::io::AsyncReadExt;

use super::frame::{self, FrameHeader, Opcode, Role};
use crate::error::{Error, Result};
use crate::stream::AsyncStream;

const READ_CHUNK: usize = 8192;
const MAX_CONTROL_PAYLOAD: usize = 125;
/// Data messages larger than this are split across continuation frames on
/// the wire; callers never see the split.
const MAX_FRAGMENT_SIZE: usize = 32 * 1024;
/// An unknown-size streaming write is split into fragments this big.
const STREAM_FRAGMENT_SIZE: usize = MAX_CONTROL_PAYLOAD;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    fn from_opcode(opcode: Opcode, data: Vec<u8>) -> Result<Self> {
        match opcode {
            Opcode::Text => String::from_utf8(data)
                .map(Message::Text)
                .map_err(|_| Error::protocol_error("text frame is not valid utf-8")),
            Opcode::Binary => Ok(Message::Binary(data)),
            _ => Err(Error::protocol_error("unexpected opcode for a complete message")),
        }
    }
}

/// A live upgrade. `role` governs masking direction: clients mask outbound
/// frames, servers never do (RFC 6455 §5.1).
pub struct WebSocket<S: AsyncStream> {
    stream: S,
    buf: Vec<u8>,
    role: Role,
    // Capacity-1, so concurrent senders (e.g. a handler writing a message
    // while a background task answers a ping) serialize instead of
    // interleaving frames on the wire.
    write_slot: Arc<Semaphore>,
    read_done: bool,
    write_done: bool,
    // Set for the lifetime of a `FragmentReader`, cleared only when its
    // message completes (not merely when the reader is dropped) so a
    // caller that abandons one mid-message is still caught.
    reading: bool,
}

impl<S: AsyncStream> WebSocket<S> {
    pub fn new(stream: S, carry: Vec<u8>, role: Role) -> Self {
        Self {
            stream,
            buf: carry,
            role,
            write_slot: Arc::new(Semaphore::new(1)),
            read_done: false,
            write_done: false,
            reading: false,
        }
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_message(Opcode::Text, text.as_bytes()).await
    }

    pub async fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.send_message(Opcode::Binary, data).await
    }

    async fn send_message(&mut self, opcode: Opcode, data: &[u8]) -> Result<()> {
        let _permit = self.write_slot.acquire().await;
        if self.write_done {
            return Err(Error::AlreadyClosed);
        }
        if data.is_empty() {
            frame::write_frame(&mut self.stream, self.role, true, opcode, &[]).await?;
            return Ok(());
        }
        let mut offset = 0;
        let mut first = true;
        while offset < data.len() {
            let end = (offset + MAX_FRAGMENT_SIZE).min(data.len());
            let is_last = end == data.len();
            let op = if first { opcode } else { Opcode::Continuation };
            frame::write_frame(&mut self.stream, self.role, is_last, op, &data[offset..end]).await?;
            first = false;
            offset = end;
        }
        Ok(())
    }

    /// Sends an unsolicited ping. Answering a peer's ping happens
    /// automatically inside [`WebSocket::receive`].
    pub async fn ping(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::invalid_argument("ping payload exceeds 125 bytes"));
        }
        let _permit = self.write_slot.acquire().await;
        if self.write_done {
            return Err(Error::AlreadyClosed);
        }
        frame::write_frame(&mut self.stream, self.role, true, Opcode::Ping, payload).await
    }

    async fn pong(&mut self, payload: &[u8]) -> Result<()> {
        let _permit = self.write_slot.acquire().await;
        if self.write_done {
            return Ok(());
        }
        frame::write_frame(&mut self.stream, self.role, true, Opcode::Pong, payload).await
    }

    /// Sends a close frame if one hasn't gone out yet. Idempotent.
    pub async fn close(&mut self, status: u16, reason: &str) -> Result<()> {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&status.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());

        let _permit = self.write_slot.acquire().await;
        if self.write_done {
            return Ok(());
        }
        frame::write_frame(&mut self.stream, self.role, true, Opcode::Close, &payload).await?;
        self.write_done = true;
        Ok(())
    }

    /// Returns the next complete message, transparently answering pings and
    /// dropping pongs (RFC 6455 §5.5). `Ok(None)` means the peer closed the
    /// session; a close frame carrying a non-clean status code (anything
    /// but 1000/1001) surfaces as a protocol error instead.
    pub async fn receive(&mut self) -> Result<Option<Message>> {
        if self.read_done {
            return Ok(None);
        }
        let mut assembling: Option<(Opcode, Vec<u8>)> = None;
        loop {
            let header = self.read_header().await?;
            let payload = self.read_payload(&header).await?;

            match header.opcode {
                Opcode::Ping => {
                    self.pong(&payload).await?;
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    self.read_done = true;
                    let (status, reason) = parse_close_payload(&payload)?;
                    let _ = self.close(status.unwrap_or(1000), "").await;
                    return match status {
                        None | Some(1000) | Some(1001) => Ok(None),
                        Some(code) => Err(Error::protocol_error(format!(
                            "peer closed with status {code}: {reason}"
                        ))),
                    };
                }
                Opcode::Continuation => {
                    let (_, buf) = assembling
                        .as_mut()
                        .ok_or_else(|| Error::protocol_error("continuation frame without a start frame"))?;
                    buf.extend(payload);
                    if header.fin {
                        let (opcode, data) = assembling.take().unwrap();
                        return Ok(Some(Message::from_opcode(opcode, data)?));
                    }
                }
                Opcode::Text | Opcode::Binary => {
                    if assembling.is_some() {
                        return Err(Error::protocol_error(
                            "new message started before the previous fragment finished",
                        ));
                    }
                    if header.fin {
                        return Ok(Some(Message::from_opcode(header.opcode, payload)?));
                    }
                    assembling = Some((header.opcode, payload));
                }
            }
        }
    }

    /// Opens a per-message reader for incremental consumption instead of
    /// buffering the whole message. `Ok(None)` means the peer already
    /// closed the session. Precondition: the previous reader (if any) ran
    /// to completion; otherwise the session is closed with status 1011
    /// and `PreviousReaderNotFinished` is returned.
    pub async fn start_receiving(&mut self) -> Result<Option<FragmentReader<'_, S>>> {
        if self.reading {
            let _ = self.close(1011, "").await;
            return Err(Error::PreviousReaderNotFinished);
        }
        if self.read_done {
            return Ok(None);
        }
        self.reading = true;
        Ok(Some(FragmentReader { ws: self, opcode: None, done: false, known_size: None }))
    }

    /// Acquires the writer slot and opens a streaming sender. When `size`
    /// is given, the message goes out as a single fragment of exactly that
    /// length; writing past it fails with `TooMuchWritten`, closing short
    /// fails with `TooLittleWritten`. Without a declared size, writes are
    /// split into fragments as they arrive and closing emits a zero-length
    /// `FIN` terminator.
    pub async fn start_sending(&mut self, size: Option<u64>) -> Result<FragmentWriter<'_, S>> {
        let permit = self.write_slot.acquire_arc().await;
        if self.write_done {
            return Err(Error::AlreadyClosed);
        }
        Ok(FragmentWriter {
            ws: self,
            _permit: permit,
            opcode: None,
            declared_size: size,
            written: 0,
            buffered: Vec::new(),
            first_frame_sent: false,
            closed: false,
        })
    }

    async fn read_header(&mut self) -> Result<FrameHeader> {
        self.ensure_buf_len(2).await?;
        let fin = self.buf[0] & 0x80 != 0;
        if self.buf[0] & 0x70 != 0 {
            return Err(Error::protocol_error("reserved bits must be zero"));
        }
        let opcode = opcode_from_bits(self.buf[0] & 0x0f)?;
        let masked = self.buf[1] & 0x80 != 0;
        let len_field = self.buf[1] & 0x7f;

        let ext_len = match len_field {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let mask_len = if masked { 4 } else { 0 };
        self.ensure_buf_len(2 + ext_len + mask_len).await?;

        let mut pos = 2;
        let len = match len_field {
            126 => {
                let v = u16::from_be_bytes([self.buf[pos], self.buf[pos + 1]]) as u64;
                pos += 2;
                v
            }
            127 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&self.buf[pos..pos + 8]);
                pos += 8;
                u64::from_be_bytes(bytes)
            }
            n => n as u64,
        };
        let mask_key = if masked {
            let mut key = [0u8; 4];
            key.copy_from_slice(&self.buf[pos..pos + 4]);
            pos += 4;
            Some(key)
        } else {
            None
        };

        self.buf.drain(..pos);
        Ok(FrameHeader { fin, opcode, len, mask_key })
    }

    async fn read_payload(&mut self, header: &FrameHeader) -> Result<Vec<u8>> {
        let len = header.len as usize;
        self.ensure_buf_len(len).await?;
        let mut payload: Vec<u8> = self.buf.drain(..len).collect();
        if let Some(key) = header.mask_key {
            frame::apply_mask(&mut payload, &key);
        }
        Ok(payload)
    }

    async fn ensure_buf_len(&mut self, len: usize) -> Result<()> {
        while self.buf.len() < len {
            let mut tmp = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                return Err(Error::UnexpectedEndOfStream);
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
        Ok(())
    }

    /// Returns the underlying stream and any unconsumed buffered bytes,
    /// releasing this session's ownership of the connection.
    pub fn detach(self) -> (S, Vec<u8>) {
        (self.stream, self.buf)
    }
}

/// Per-message streaming reader returned by [`WebSocket::start_receiving`].
pub struct FragmentReader<'a, S: AsyncStream> {
    ws: &'a mut WebSocket<S>,
    opcode: Option<Opcode>,
    done: bool,
    known_size: Option<u64>,
}

impl<'a, S: AsyncStream> FragmentReader<'a, S> {
    /// The message's opcode, known once the first fragment has arrived.
    pub fn opcode(&self) -> Option<Opcode> {
        self.opcode
    }

    /// The message's total length, if the first fragment carried `FIN`
    /// (a single-fragment message); `None` means the length isn't known
    /// until the stream ends.
    pub fn known_size(&self) -> Option<u64> {
        self.known_size
    }

    /// Returns the next fragment's payload, or `None` once the message's
    /// final fragment has been delivered. Pings encountered mid-stream are
    /// answered transparently; pongs are drained and discarded.
    pub async fn next_fragment(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let header = self.ws.read_header().await?;
            match header.opcode {
                Opcode::Ping => {
                    let payload = self.ws.read_payload(&header).await?;
                    self.ws.pong(&payload).await?;
                }
                Opcode::Pong => {
                    self.ws.read_payload(&header).await?;
                }
                Opcode::Close => {
                    let payload = self.ws.read_payload(&header).await?;
                    self.ws.read_done = true;
                    self.done = true;
                    self.ws.reading = false;
                    let (status, reason) = parse_close_payload(&payload)?;
                    let _ = self.ws.close(status.unwrap_or(1000), "").await;
                    return match status {
                        None | Some(1000) | Some(1001) => Ok(None),
                        Some(code) => Err(Error::protocol_error(format!(
                            "peer closed with status {code}: {reason}"
                        ))),
                    };
                }
                Opcode::Continuation => {
                    if self.opcode.is_none() {
                        self.ws.reading = false;
                        return Err(Error::protocol_error("continuation frame without a start frame"));
                    }
                    let payload = self.ws.read_payload(&header).await?;
                    if header.fin {
                        self.done = true;
                        self.ws.reading = false;
                    }
                    return Ok(Some(payload));
                }
                Opcode::Text | Opcode::Binary => {
                    if self.opcode.is_some() {
                        self.ws.reading = false;
                        return Err(Error::protocol_error(
                            "new message started before the previous fragment finished",
                        ));
                    }
                    self.opcode = Some(header.opcode);
                    if header.fin {
                        self.known_size = Some(header.len);
                        self.done = true;
                        self.ws.reading = false;
                    }
                    let payload = self.ws.read_payload(&header).await?;
                    return Ok(Some(payload));
                }
            }
        }
    }
}

/// Per-message streaming writer returned by [`WebSocket::start_sending`].
pub struct FragmentWriter<'a, S: AsyncStream> {
    ws: &'a mut WebSocket<S>,
    _permit: SemaphoreGuardArc,
    opcode: Option<Opcode>,
    declared_size: Option<u64>,
    written: u64,
    buffered: Vec<u8>,
    first_frame_sent: bool,
    closed: bool,
}

impl<'a, S: AsyncStream> FragmentWriter<'a, S> {
    /// Writes a chunk of a text message. The first call (across
    /// `write_text`/`write_bytes`) fixes the message's opcode.
    pub async fn write_text(&mut self, text: &str) -> Result<()> {
        self.set_default_opcode(Opcode::Text);
        self.write(text.as_bytes()).await
    }

    /// Writes a chunk of a binary message. The first call (across
    /// `write_text`/`write_bytes`) fixes the message's opcode.
    pub async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.set_default_opcode(Opcode::Binary);
        self.write(data).await
    }

    fn set_default_opcode(&mut self, opcode: Opcode) {
        if self.opcode.is_none() {
            self.opcode = Some(opcode);
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        if let Some(size) = self.declared_size {
            if self.written + data.len() as u64 > size {
                return Err(Error::TooMuchWritten);
            }
            self.written += data.len() as u64;
            self.buffered.extend_from_slice(data);
            return Ok(());
        }

        self.written += data.len() as u64;
        self.buffered.extend_from_slice(data);
        while self.buffered.len() >= STREAM_FRAGMENT_SIZE {
            let chunk: Vec<u8> = self.buffered.drain(..STREAM_FRAGMENT_SIZE).collect();
            self.emit_fragment(false, &chunk).await?;
        }
        Ok(())
    }

    /// Writes one wire frame, using the message's opcode for the first
    /// frame sent and `Continuation` for every one after it.
    async fn emit_fragment(&mut self, fin: bool, data: &[u8]) -> Result<()> {
        let op = if self.first_frame_sent { Opcode::Continuation } else { self.opcode.unwrap_or(Opcode::Binary) };
        frame::write_frame(&mut self.ws.stream, self.ws.role, fin, op, data).await?;
        self.first_frame_sent = true;
        Ok(())
    }

    /// Finishes the message: flushes any remaining buffered bytes as the
    /// final fragment. For a known-size writer this fails with
    /// `TooLittleWritten` if fewer than the declared number of bytes were
    /// written; for an unknown-size writer it always emits a zero-length
    /// `FIN` terminator after the remainder.
    pub async fn finish(mut self) -> Result<()> {
        self.close_writer().await
    }

    async fn close_writer(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(size) = self.declared_size {
            if self.written < size {
                return Err(Error::TooLittleWritten);
            }
            let data = std::mem::take(&mut self.buffered);
            self.emit_fragment(true, &data).await
        } else {
            let remainder = std::mem::take(&mut self.buffered);
            if !remainder.is_empty() {
                self.emit_fragment(false, &remainder).await?;
            }
            self.emit_fragment(true, &[]).await
        }
    }
}

fn opcode_from_bits(bits: u8) -> Result<Opcode> {
    Ok(match bits {
        0 => Opcode::Continuation,
        1 => Opcode::Text,
        2 => Opcode::Binary,
        8 => Opcode::Close,
        9 => Opcode::Ping,
        10 => Opcode::Pong,
        other => return Err(Error::protocol_error(format!("unsupported opcode: {other}"))),
    })
}

fn parse_close_payload(payload: &[u8]) -> Result<(Option<u16>, String)> {
    if payload.is_empty() {
        return Ok((None, String::new()));
    }
    if payload.len() < 2 {
        return Err(Error::protocol_error("close frame payload shorter than a status code"));
    }
    let status = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8(payload[2..].to_vec())
        .map_err(|_| Error::protocol_error("close reason is not valid utf-8"))?;
    Ok((Some(status), reason))
}
