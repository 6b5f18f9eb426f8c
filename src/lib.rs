//! shellbridge - terminal sessions over WebSockets
//!
//! Brokers SSH and local shell sessions to browser clients. A session is
//! created over HTTP, then a single WebSocket attaches to it and carries
//! keystrokes, commands, and resizes in one direction and terminal output in
//! the other.

pub mod api;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod local;
pub mod pipe;
pub mod protocol;
pub mod pty;
pub mod session;
pub mod ssh;
pub mod supervisor;
pub mod targets;
