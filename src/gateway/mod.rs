//! Session gateway: the streaming listener and per-connection protocol.
//!
//! [`SessionGateway::serve`] accepts TCP connections and hands each one to
//! [`SessionGateway::handle_connection`], which runs the admission checks
//! and the session state machine in [`connection`].

pub mod auth;
pub mod connection;
pub mod frames;
pub mod media;
pub mod writer;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::capacity::SessionCapacityManager;
use crate::eventlog::StructuredEventLog;
use crate::guard::ConnectionGuard;
use crate::runner::RunnerFactory;
use crate::Result;

pub use auth::AuthPolicy;
pub use frames::{ClientFrame, ClientPayload, EventKind, Priority, ServerFrame, ServerPayload};

/// Shared services every connection task uses.
#[derive(Clone)]
pub struct GatewayServices {
    /// Peer admission and message limiting.
    pub guard: Arc<ConnectionGuard>,
    /// Session caps.
    pub capacity: Arc<SessionCapacityManager>,
    /// Runner resolution.
    pub runners: RunnerFactory,
    /// Product-level event log.
    pub events: Arc<StructuredEventLog>,
    /// API key policy.
    pub auth: Arc<AuthPolicy>,
    /// Root directory for client uploads.
    pub upload_root: PathBuf,
}

/// Streaming front door.
#[derive(Clone)]
pub struct SessionGateway {
    services: GatewayServices,
}

impl SessionGateway {
    /// Wrap the shared services.
    #[must_use]
    pub fn new(services: GatewayServices) -> Self {
        Self { services }
    }

    /// Shared services.
    #[must_use]
    pub fn services(&self) -> &GatewayServices {
        &self.services
    }

    /// Accept connections until `cancel` fires.
    ///
    /// Each connection runs on its own task with a child token, so shutdown
    /// tears every live session down cleanly.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` only if the listener's local address is
    /// unavailable; accept errors are logged and the loop continues.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let local = listener.local_addr()?;
        info!(%local, "session gateway listening");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("session gateway shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if let Err(err) = stream.set_nodelay(true) {
                                debug!(%addr, %err, "set_nodelay failed");
                            }
                            let gateway = self.clone();
                            let token = cancel.child_token();
                            let peer = addr.to_string();
                            let span = info_span!("connection", peer = %peer);
                            tokio::spawn(
                                async move { gateway.handle_connection(stream, peer, token).await }
                                    .instrument(span),
                            );
                        }
                        Err(err) => warn!(%err, "accept failed"),
                    }
                }
            }
        }
        Ok(())
    }

    /// Run the full protocol on one already-accepted stream.
    pub async fn handle_connection<S>(&self, stream: S, peer: String, cancel: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        connection::run(&self.services, stream, peer, cancel).await;
    }
}
