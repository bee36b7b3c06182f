//! Request/response body framing: the four ways a body's end can be known.

mod reader;
mod writer;

pub use reader::BodyReader;
pub use writer::BodyWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    ContentLength(u64),
    Chunked,
    /// Body ends when the peer closes the connection (no framing header at
    /// all). Only ever a read-side framing; a writer can't use it and still
    /// support keep-alive.
    Unknown,
}

const MAX_CHUNK_LINE_BYTES: usize = 8 * 1024;
const MAX_TRAILER_BYTES: usize = 32 * 1024;
const READ_CHUNK: usize = 64 * 1024;
