//! Single outbound writer per stream.
//!
//! Every producer (connection reader, stdout/stderr/signal pumps) holds a
//! [`FrameSender`]; only the task spawned by [`spawn_frame_writer`] touches
//! the socket, so frames are never interleaved.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::frames::{EventKind, ServerFrame, ServerPayload};

/// Outbound queue depth per stream.
pub const OUTBOUND_CAPACITY: usize = 512;

/// Cloneable handle for queueing frames to one client.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<ServerFrame>,
    correlation: watch::Receiver<Option<String>>,
}

impl FrameSender {
    /// Queue a payload tagged with the latest correlation id.
    ///
    /// Returns `false` once the writer has gone away.
    pub async fn send(&self, payload: ServerPayload) -> bool {
        let frame = ServerFrame {
            correlation_id: self.correlation.borrow().clone(),
            priority: payload.default_priority(),
            payload,
        };
        self.tx.send(frame).await.is_ok()
    }

    /// Queue an `output` frame.
    pub async fn output(&self, text: String) -> bool {
        self.send(ServerPayload::Output { text }).await
    }

    /// Queue an `error` frame.
    pub async fn error(&self, text: impl Into<String>) -> bool {
        self.send(ServerPayload::Error { text: text.into() }).await
    }

    /// Queue an `event` frame.
    pub async fn event(
        &self,
        kind: EventKind,
        message: impl Into<String>,
        session_id: Option<&str>,
    ) -> bool {
        self.send(ServerPayload::Event {
            kind,
            message: message.into(),
            session_id: session_id.map(str::to_owned),
        })
        .await
    }
}

/// Spawn the writer task for `writer`.
///
/// Returns the sender handle, the correlation publisher the reader updates,
/// and the task handle. The task ends once every [`FrameSender`] clone is
/// dropped and the queue drains, or on the first write error.
pub fn spawn_frame_writer<W>(
    writer: W,
    label: String,
) -> (FrameSender, watch::Sender<Option<String>>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (corr_tx, corr_rx) = watch::channel(None);
    let handle = tokio::spawn(run_writer(writer, rx, label));
    (
        FrameSender {
            tx,
            correlation: corr_rx,
        },
        corr_tx,
        handle,
    )
}

async fn run_writer<W>(mut writer: W, mut rx: mpsc::Receiver<ServerFrame>, label: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let mut line = match serde_json::to_vec(&frame) {
            Ok(line) => line,
            Err(err) => {
                warn!(peer = label, %err, "failed to serialise outbound frame");
                continue;
            }
        };
        line.push(b'\n');

        let written = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            debug!(peer = label, %err, "outbound write failed, closing writer");
            rx.close();
            break;
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!(peer = label, %err, "outbound shutdown failed");
    }
}
