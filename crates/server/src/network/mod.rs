//! OPC network front end
//!
//! A TCP listener plus one reader task per accepted client. Connections
//! own their framing state; parsed messages flow to the core over an
//! mpsc channel, which preserves per-connection arrival order.

pub mod connection;
pub mod listener;

pub use listener::Listener;
