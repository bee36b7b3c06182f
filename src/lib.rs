//! HTTP/1.1 client and server core with integrated WebSocket upgrade
//! support: a hand-rolled connection state machine (no hyper, no tokio)
//! built directly on `smol`, plus the URI, header, and body-framing rules
//! that sit underneath it.
//!
//! [`client::Client`] and [`server::Server`] are the two entry points;
//! [`connection::Connection`] is the shared engine both sides drive.

pub mod body;
pub mod client;
pub mod connection;
pub mod encoding;
pub mod error;
pub mod headers;
pub mod method;
pub mod pool;
pub mod request;
pub mod response;
pub mod security;
pub mod server;
pub mod status;
pub mod stream;
pub mod uri;
pub mod websocket;

pub use client::{Client, Connector, PlainConnector};
pub use connection::{Connection, Role};
pub use error::{Error, Result};
pub use headers::Headers;
pub use method::Method;
pub use response::Response;
pub use server::{Handler, Request, ResponseWriter, Server};
pub use stream::AsyncStream;
pub use uri::{ParsedUri, Scheme};
pub use websocket::{Message, WebSocket};
