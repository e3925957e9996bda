//! Shell host
//!
//! Runs inside a participant's sandbox. Spawns one interactive shell on a
//! pseudo-terminal at start-up and exposes its raw byte stream as a
//! WebSocket channel on a fixed port.

pub mod actors;
pub mod api;
pub mod app_state;
pub mod config;
pub mod error;

pub use error::ShellHostError;
