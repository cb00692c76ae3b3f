//! Single writer per connection.
//!
//! Every outbound frame goes through one queue drained by one task, so a
//! frame is always written whole and frames leave in the order they were
//! queued.

use crate::error::CallError;
use bytes::BytesMut;
use engine_protocol::{Encoder, Message};
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Frames written before a single flush.
const MAX_BATCH: usize = 64;

/// Cloneable handle for queueing messages on a connection.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<BytesMut>,
    encoder: Encoder,
}

impl Outbound {
    /// Encodes and queues a message, waiting for queue space.
    ///
    /// Encoding happens here so that an oversized message fails for its
    /// sender without touching the connection.
    pub async fn send(&self, message: &Message) -> Result<(), CallError> {
        let frame = self.encoder.encode(message)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| CallError::ConnectionLost("connection writer closed".to_string()))
    }

    /// Encodes and queues a message without waiting.
    pub fn try_send(&self, message: &Message) -> Result<(), CallError> {
        let frame = self.encoder.encode(message)?;
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                CallError::Internal("outbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                CallError::ConnectionLost("connection writer closed".to_string())
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Stops the writer after flushing whatever is already queued.
///
/// Dropping it has the same effect.
#[derive(Debug)]
pub struct WriterShutdown(oneshot::Sender<()>);

impl WriterShutdown {
    pub fn shutdown(self) {
        let _ = self.0.send(());
    }
}

/// Starts the writer task for `writer`.
pub fn spawn_writer<W>(
    writer: W,
    encoder: Encoder,
    capacity: usize,
) -> (Outbound, WriterShutdown, JoinHandle<io::Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity);
    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(write_loop(writer, rx, stop_rx));
    (Outbound { tx, encoder }, WriterShutdown(stop_tx), task)
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<BytesMut>,
    mut stop: oneshot::Receiver<()>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                writer.write_all(&frame).await?;
                let mut batched = 1;
                while batched < MAX_BATCH {
                    match rx.try_recv() {
                        Ok(frame) => {
                            writer.write_all(&frame).await?;
                            batched += 1;
                        }
                        Err(_) => break,
                    }
                }
                writer.flush().await?;
            }

            _ = &mut stop => {
                rx.close();
                while let Some(frame) = rx.recv().await {
                    writer.write_all(&frame).await?;
                }
                break;
            }
        }
    }

    writer.flush().await?;
    let _ = writer.shutdown().await;
    tracing::trace!("Writer stopped");
    Ok(())
}
