//! Relay WebSocket endpoint
//!
//! Each browser socket attaches to any number of targets:
//! - link output and tmux notifications fan out from a shared connection
//! - focus changes go through a per-target switch barrier

mod barrier;
pub mod client_state;
pub(crate) mod dispatch;
mod handler;
pub mod protocol;

pub use handler::handle_relay_ws;
