//! Outbound half of a worker's coordinator connection.
//!
//! All results of one worker go through a single unbounded queue drained by
//! one writer task, so the coordinator sees them in emission order.

use bytes::Bytes;
use futures::{Sink, SinkExt};
use gaia_ga_protocol::{ProtocolError, WorkerResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cloneable producer side of the outbound queue.
#[derive(Clone)]
pub struct ResultSender {
    tx: mpsc::UnboundedSender<WorkerResult>,
}

impl ResultSender {
    /// Returns false once the connection is closed; the result is dropped.
    pub fn send(&self, result: WorkerResult) -> bool {
        let kind = result.kind();
        match self.tx.send(result) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(kind, "Connection closed, result dropped");
                false
            }
        }
    }
}

/// An open connection: the outbound queue and the switch that closes it.
pub struct Connection {
    sender: ResultSender,
    closed: CancellationToken,
}

impl Connection {
    pub fn sender(&self) -> &ResultSender {
        &self.sender
    }

    /// Results already queued are still written, then the sink is closed.
    pub fn close(self) {
        self.closed.cancel();
    }
}

/// Open a connection over `sink`, spawning its writer task. A transport
/// failure in the writer cancels `shutdown`.
pub fn open<S>(sink: S, shutdown: CancellationToken) -> (Connection, JoinHandle<()>)
where
    S: Sink<Bytes, Error = ProtocolError> + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    let writer = tokio::spawn(forward_results(sink, rx, closed.clone(), shutdown));
    (Connection { sender: ResultSender { tx }, closed }, writer)
}

async fn forward_results<S>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<WorkerResult>,
    closed: CancellationToken,
    shutdown: CancellationToken,
) where
    S: Sink<Bytes, Error = ProtocolError> + Unpin,
{
    let mut draining = false;
    loop {
        let next = if draining {
            rx.recv().await
        } else {
            tokio::select! {
                biased;
                next = rx.recv() => next,
                _ = closed.cancelled() => {
                    rx.close();
                    draining = true;
                    continue;
                }
            }
        };
        let Some(result) = next else { break };

        let body = match result.encode() {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(kind = result.kind(), "Failed to encode result: {e}");
                continue;
            }
        };
        match sink.send(body).await {
            Ok(()) => {}
            Err(ProtocolError::Io(e)) => {
                tracing::warn!("Connection lost while sending results: {e}");
                shutdown.cancel();
                break;
            }
            // per-frame refusal (oversized, delimiter); the stream stays usable
            Err(e) => tracing::error!(kind = result.kind(), "Result dropped: {e}"),
        }
    }
    if let Err(e) = sink.close().await {
        tracing::debug!("Error while closing connection: {e}");
    }
}

/// Connection whose results land in a channel instead of a socket.
#[cfg(test)]
pub fn capture() -> (Connection, mpsc::UnboundedReceiver<WorkerResult>, CancellationToken) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    (Connection { sender: ResultSender { tx }, closed: closed.clone() }, rx, closed)
}
