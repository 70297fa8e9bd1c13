use crate::error::{ReconnectError, Result};
use crate::wire;
use serde::Serialize;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// The output side of one direction of the byte stream. `send` hands a
/// message to a bounded queue drained by a dedicated background task; the
/// background task owns the write half exclusively — the stream is split
/// once and each half belongs to its pump task only.
pub struct AsyncOutputStream<T> {
    tx: Option<mpsc::Sender<T>>,
    task: JoinHandle<Result<()>>,
}

impl<T> AsyncOutputStream<T>
where
    T: Serialize + Send + std::fmt::Debug + 'static,
{
    pub fn new<W>(writer: W, buffer_size: usize, flush_interval: Duration, max_message_size: u32) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        let task = tokio::spawn(Self::pump(writer, rx, flush_interval, max_message_size));
        AsyncOutputStream { tx: Some(tx), task }
    }

    /// Enqueues `msg`, failing with `Timeout` if the queue does not have
    /// room within `send_timeout`. A timed-out send closes the underlying
    /// stream — no message can be sent on this instance after that.
    pub async fn send(&self, msg: T, send_timeout: Duration) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(ReconnectError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "output stream already closed",
            )))?;
        match tokio::time::timeout(send_timeout, tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ReconnectError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "output pump has shut down",
            ))),
            Err(_) => {
                warn!("send timed out, closing output stream");
                Err(ReconnectError::Timeout("async output send"))
            }
        }
    }

    /// Drains and flushes whatever remains, then joins the pump task.
    /// Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        self.tx.take();
        if let Some(result) = (&mut self.task).await.ok() {
            result
        } else {
            Ok(())
        }
    }

    async fn pump<W>(
        mut writer: W,
        mut rx: mpsc::Receiver<T>,
        flush_interval: Duration,
        max_message_size: u32,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        use tokio::io::AsyncWriteExt;
        let mut last_flush = Instant::now();
        loop {
            match rx.try_recv() {
                Ok(msg) => {
                    trace!(?msg, "writing message");
                    wire::write_message(&mut writer, &msg, max_message_size).await?;
                    if last_flush.elapsed() >= flush_interval {
                        writer.flush().await?;
                        last_flush = Instant::now();
                    }
                }
                Err(TryRecvError::Empty) => {
                    // The queue has drained: flush now, then block until
                    // either the next message or a close.
                    writer.flush().await?;
                    last_flush = Instant::now();
                    match rx.recv().await {
                        Some(msg) => {
                            wire::write_message(&mut writer, &msg, max_message_size).await?;
                        }
                        None => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }
        writer.flush().await?;
        writer.shutdown().await?;
        debug!("output pump exited, final flush complete");
        Ok(())
    }
}
