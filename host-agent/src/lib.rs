//! Per-host agent library: multiplexes container log/exec/proxy/stats
//! sessions over one outbound websocket, and reacts to container
//! lifecycle events to inject IP/DNS configuration.
//!
//! `main.rs` is a thin CLI wrapper around the pieces assembled here;
//! everything with actual behavior lives in these modules so it can be
//! exercised directly by tests.

pub mod auth;
pub mod config;
pub mod engine;
pub mod events;
pub mod handlers;
pub mod healthcheck;
pub mod locks;
pub mod proxy;
pub mod retry;
