//! tmux_link - one control-mode connection to one tmux session
//!
//! A link spawns `tmux -C` locally or through `ssh`, owns its stdin from a
//! single actor task, correlates command replies in order and emits
//! everything else as [`LinkEvent`]s. It never retries; callers decide
//! what a lost connection means.
//!
//! # Example
//!
//! ```no_run
//! use tmux_link::{LinkConfig, LinkEvent, SessionControl, Transport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = LinkConfig::new("local", Transport::Local, "main");
//!     let (link, mut events) = tmux_link::connect(&config, None).await.unwrap();
//!
//!     let snapshot = link.request_snapshot().await.unwrap();
//!     println!("{} windows", snapshot.windows.len());
//!
//!     while let Some(event) = events.recv().await {
//!         if let LinkEvent::Closed { reason } = event {
//!             println!("closed: {}", reason);
//!             break;
//!         }
//!     }
//! }
//! ```

pub mod commands;
pub mod error;
pub mod history;
pub mod link;
pub mod snapshot;
pub mod transport;

pub use error::{ConnectFailure, LinkError};
pub use history::select_history;
pub use link::{
    CloseReason, LinkConfig, LinkEvent, LinkHandle, LinkStatus, SessionControl, StatusSink,
    attach_io, connect,
};
pub use snapshot::{PaneInfo, SessionInfo, SessionSnapshot, WindowInfo};
pub use transport::{SshAuth, SshTarget, Transport};

// Re-exported so consumers can match on notifications without a direct dependency.
pub use tmux_control::ControlEvent;
