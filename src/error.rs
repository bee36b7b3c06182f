//! Crate-wide error type and `Result` alias.
//!
//! Mirrors the taxonomy a protocol engine like this one actually raises:
//! argument mistakes, wire-format violations, policy violations (redirect
//! budgets, slot discipline) and transport failures. Hand-written `Display`
//! and `std::error::Error`, no derive macro for it.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    InvalidArgument(String),
    UriParsing(String),
    IllegalHostname(String),
    IllegalPath(String),
    IntegerParsing(String),
    FormatError(String),
    FoldedHeader,
    ProtocolError(String),
    UnexpectedEndOfStream,
    MissingHeaderInResponse(String),
    UnknownHeaderInResponse(String),
    TooManyRedirects,
    InvalidRedirect(String),
    PreviousRequestNotCompleted,
    PreviousReaderNotFinished,
    TooMuchWritten,
    TooLittleWritten,
    HeadersAlreadyWritten,
    AlreadyClosed,
    DeadlineExceeded,
    Io(io::Error),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn uri_parsing(msg: impl Into<String>) -> Self {
        Self::UriParsing(msg.into())
    }

    pub fn illegal_hostname(msg: impl Into<String>) -> Self {
        Self::IllegalHostname(msg.into())
    }

    pub fn illegal_path(msg: impl Into<String>) -> Self {
        Self::IllegalPath(msg.into())
    }

    pub fn format_error(msg: impl Into<String>) -> Self {
        Self::FormatError(msg.into())
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    pub fn invalid_redirect(msg: impl Into<String>) -> Self {
        Self::InvalidRedirect(msg.into())
    }

    /// Transport failures the server treats as a benign end-of-connection
    /// rather than a bug worth a stack trace (spec §7 "close exceptions").
    pub fn is_close_exception(&self) -> bool {
        match self {
            Error::UnexpectedEndOfStream => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(m) => write!(f, "invalid argument: {m}"),
            Error::UriParsing(m) => write!(f, "uri parsing error: {m}"),
            Error::IllegalHostname(m) => write!(f, "illegal hostname: {m}"),
            Error::IllegalPath(m) => write!(f, "illegal path: {m}"),
            Error::IntegerParsing(m) => write!(f, "integer parsing error: {m}"),
            Error::FormatError(m) => write!(f, "format error: {m}"),
            Error::FoldedHeader => write!(f, "folded header lines are not supported"),
            Error::ProtocolError(m) => write!(f, "protocol error: {m}"),
            Error::UnexpectedEndOfStream => write!(f, "unexpected end of stream"),
            Error::MissingHeaderInResponse(h) => write!(f, "missing header in response: {h}"),
            Error::UnknownHeaderInResponse(h) => write!(f, "unknown header in response: {h}"),
            Error::TooManyRedirects => write!(f, "too many redirects"),
            Error::InvalidRedirect(m) => write!(f, "invalid redirect: {m}"),
            Error::PreviousRequestNotCompleted => write!(f, "previous request not completed"),
            Error::PreviousReaderNotFinished => write!(f, "previous reader not finished"),
            Error::TooMuchWritten => write!(f, "too much written"),
            Error::TooLittleWritten => write!(f, "too little written"),
            Error::HeadersAlreadyWritten => write!(f, "headers already written"),
            Error::AlreadyClosed => write!(f, "already closed"),
            Error::DeadlineExceeded => write!(f, "deadline exceeded"),
            Error::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Error::IntegerParsing(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_exception_classifies_transport_errors() {
        let err = Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        assert!(err.is_close_exception());

        let err = Error::Io(io::Error::new(io::ErrorKind::Other, "weird"));
        assert!(!err.is_close_exception());

        assert!(Error::UnexpectedEndOfStream.is_close_exception());
        assert!(!Error::TooManyRedirects.is_close_exception());
    }

    #[test]
    fn display_is_non_empty() {
        assert!(!Error::FoldedHeader.to_string().is_empty());
    }
}
