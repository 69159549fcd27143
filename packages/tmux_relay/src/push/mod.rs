//! Background links that turn terminal bells into notifications.

pub mod bell;
mod supervisor;

pub use supervisor::PushSupervisor;
