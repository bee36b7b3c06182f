//! RFC 6455 WebSocket support layered on top of a detached HTTP connection.

pub mod frame;
pub mod session;

pub use frame::Role;
pub use session::{Message, WebSocket};
