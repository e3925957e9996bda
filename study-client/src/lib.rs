//! Study client
//!
//! The participant-side half of the terminal session bridge, without a
//! browser: a terminal controller bound to one relay channel at a time, a
//! pluggable command-boundary detector, and the task lifecycle machine
//! driven by a session actor.

pub mod accumulator;
pub mod actors;
pub mod backend;
pub mod channel;
pub mod config;
pub mod controller;
pub mod detector;
pub mod lifecycle;
pub mod notice;

pub use actors::session::{SessionActor, SessionArguments, SessionMsg};
pub use lifecycle::{Effect, LifecycleEvent, Phase, Session, TaskLifecycle};
pub use notice::Notice;
