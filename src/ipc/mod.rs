//! Local IPC layer for `agent-gateway-ctl` interaction.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line management commands from the companion CLI.

pub mod server;
