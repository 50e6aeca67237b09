#![forbid(unsafe_code)]

//! `agent-gateway-ctl`: local CLI companion for `agent-gateway`.
//!
//! Connects to the IPC socket and sends JSON management commands to the
//! running gateway. The per-instance auth token is read from the file the
//! server writes at startup.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "agent-gateway-ctl",
    about = "Local CLI for the agent-gateway server",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the server's `server.ipc_name`).
    #[arg(long, default_value = "agent-gateway")]
    ipc_name: String,

    /// File holding the server's IPC auth token.
    #[arg(long, default_value = ".agent-gateway/data/ctl.token")]
    token_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show session capacity.
    Status {
        /// Agent id to report on; defaults to the server's default agent.
        #[arg(long)]
        agent: Option<String>,
    },

    /// List open sessions.
    Sessions,

    /// List sessions abandoned by their clients.
    Abandoned,

    /// Stop a running session.
    Terminate {
        /// Session id.
        id: String,
    },

    /// List peers with open connections.
    Peers,

    /// List banned peers.
    Banned,

    /// Ban a peer address.
    Ban {
        /// Peer address (port is ignored).
        peer: String,
        /// Reason recorded with the ban.
        #[arg(long)]
        reason: Option<String>,
    },

    /// Lift a ban.
    Unban {
        /// Peer address.
        peer: String,
    },

    /// Show recent connection history.
    History {
        /// Maximum rows to return.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Show structured event-log entries.
    Events {
        /// Return entries with an id greater than this.
        #[arg(long, default_value_t = 0)]
        from: i64,
        /// Maximum entries to return.
        #[arg(long)]
        limit: Option<i64>,
    },
}

impl Command {
    fn to_request(&self) -> serde_json::Value {
        let mut req = match self {
            Self::Status { agent } => serde_json::json!({ "command": "status", "agent_id": agent }),
            Self::Sessions => serde_json::json!({ "command": "sessions" }),
            Self::Abandoned => serde_json::json!({ "command": "abandoned" }),
            Self::Terminate { id } => serde_json::json!({ "command": "terminate", "id": id }),
            Self::Peers => serde_json::json!({ "command": "peers" }),
            Self::Banned => serde_json::json!({ "command": "banned" }),
            Self::Ban { peer, reason } => {
                serde_json::json!({ "command": "ban", "peer": peer, "reason": reason })
            }
            Self::Unban { peer } => serde_json::json!({ "command": "unban", "peer": peer }),
            Self::History { limit } => serde_json::json!({ "command": "history", "limit": limit }),
            Self::Events { from, limit } => {
                serde_json::json!({ "command": "events", "from": from, "limit": limit })
            }
        };
        // Drop nulls so the server sees absent optionals.
        if let Some(obj) = req.as_object_mut() {
            obj.retain(|_, v| !v.is_null());
        }
        req
    }
}

fn main() {
    let args = Cli::parse();

    let mut request_json = args.command.to_request();
    if let Some(token) = read_token(&args.token_file) {
        request_json["auth_token"] = serde_json::Value::String(token);
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is agent-gateway running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Read the token file; a missing file means the server runs without one.
fn read_token(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|raw| raw.trim().to_owned())
        .filter(|token| !token.is_empty())
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
