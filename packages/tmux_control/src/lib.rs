//! tmux_control - parser for tmux control mode
//!
//! Turns the byte stream of a `tmux -C` client into structured notifications
//! and command reply blocks. The parser does no I/O.

pub mod octal;
pub mod parser;

pub use octal::decode_octal;
pub use parser::{Block, ControlEvent, ControlParser};
