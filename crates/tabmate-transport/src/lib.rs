//! Transport layer for table sessions.
//!
//! Provides:
//! - Connection reader/writer pumps over any WebSocket-shaped stream and sink
//! - `open_session` and the axum WebSocket handler (feature: websocket)
//! - HTTP table API (feature: websocket)

#[cfg(feature = "websocket")]
pub mod api;
#[cfg(feature = "websocket")]
pub mod connection;
#[cfg(feature = "websocket")]
pub mod error;
#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "websocket")]
pub use api::router;
#[cfg(feature = "websocket")]
pub use connection::{Connection, ConnectionConfig, attach};
#[cfg(feature = "websocket")]
pub use error::{ApiError, SessionError};
#[cfg(feature = "websocket")]
pub use websocket::{AppState, admit, open_session, ws_handler};
