//! Operator console
//!
//! Input handling, message history and frame layout. Nothing here knows
//! about terminals: frames go to a `Surface` and keys arrive as `Key`.

pub mod app;
pub mod history;
pub mod render;
pub mod session;
pub mod wrap;

pub use app::{Console, Flow};
pub use history::{LogEntry, MessageLog};
pub use render::{Surface, Tint};
pub use session::{InputMode, Key};
