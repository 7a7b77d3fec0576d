//! Creevey Web Server
//!
//! Serves the run state to UI clients: a WebSocket with the sequenced status
//! stream, a JSON status endpoint and the report images.

pub mod hub;
pub mod server;

pub use hub::{ClientSequence, ClientSession};
pub use server::{serve, WebServer};
