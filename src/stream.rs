//! The opaque bidirectional byte stream boundary.
//!
//! `Connection` is generic over this trait rather than a concrete
//! `smol::net::TcpStream`, so a TLS-wrapped stream can be substituted by the
//! caller without this crate depending on a TLS implementation.

use smol::io::{AsyncRead, AsyncWrite};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Disables Nagle's algorithm where the underlying transport supports it.
    fn set_nodelay(&self, nodelay: bool) -> std::io::Result<()>;
}

impl AsyncStream for smol::net::TcpStream {
    fn set_nodelay(&self, nodelay: bool) -> std::io::Result<()> {
        smol::net::TcpStream::set_nodelay(self, nodelay)
    }
}

impl AsyncStream for Box<dyn AsyncStream> {
    fn set_nodelay(&self, nodelay: bool) -> std::io::Result<()> {
        (**self).set_nodelay(nodelay)
    }
}
