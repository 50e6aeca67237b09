#![forbid(unsafe_code)]

//! `agent-gateway` bridges remote streaming clients to locally spawned agent
//! CLIs, with per-peer admission control, session caps, a structured event
//! log and an operator management surface.

pub mod capacity;
pub mod codec;
pub mod config;
pub mod config_watcher;
pub mod errors;
pub mod eventlog;
pub mod gateway;
pub mod guard;
pub mod ipc;
pub mod management;
pub mod models;
pub mod path_safety;
pub mod runner;

pub use config::GatewayConfig;
pub use errors::{AppError, Result};
