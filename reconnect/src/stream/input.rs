use crate::error::{ReconnectError, Result};
use crate::wire;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// The input side of one direction of the byte stream. The caller declares
/// how many messages it expects next via [`anticipate`](Self::anticipate);
/// the background task deserialises exactly that many messages off the
/// wire and buffers them for [`read_anticipated`](Self::read_anticipated).
///
/// This two-step protocol exists because the teacher/learner traversal
/// knows, at any point, exactly how many more responses or lessons it is
/// owed — it never wants to read speculatively ahead of what it has
/// already asked for.
pub struct AsyncInputStream<T> {
    expected: Arc<AtomicUsize>,
    rx: mpsc::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T> AsyncInputStream<T>
where
    T: DeserializeOwned + Send + std::fmt::Debug + 'static,
{
    pub fn new<R>(reader: R, buffer_size: usize, max_message_size: u32) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let expected = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        let task = tokio::spawn(Self::pump(reader, tx, expected.clone(), max_message_size));
        AsyncInputStream { expected, rx, task }
    }

    /// Declares that one more message is expected next.
    pub fn anticipate(&self) {
        self.expected.fetch_add(1, Ordering::SeqCst);
    }

    /// Blocks up to `poll_timeout` for the next anticipated message.
    /// Failing to obtain one within the timeout is fatal: the underlying
    /// stream is closed (the only way to unblock a pump thread stuck in a
    /// blocking `read`) and `Timeout` is returned.
    pub async fn read_anticipated(&mut self, poll_timeout: Duration) -> Result<T> {
        match tokio::time::timeout(poll_timeout, self.rx.recv()).await {
            Ok(Some(msg)) => {
                trace!(?msg, "read anticipated message");
                Ok(msg)
            }
            Ok(None) => {
                self.task.abort();
                Err(ReconnectError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "input pump closed before delivering an anticipated message",
                )))
            }
            Err(_) => {
                self.task.abort();
                Err(ReconnectError::Timeout("async input read"))
            }
        }
    }

    /// Closes the pump and joins it. Any messages still queued (i.e.
    /// deserialised but not yet consumed by `read_anticipated`) are dropped
    /// here, which in Rust already runs their destructors, so releasing
    /// queued items is ordinary ownership rather than a manual release
    /// call. `abort` is a synchronous barrier: no `read_anticipated` call
    /// is valid after it returns.
    pub async fn abort(mut self) {
        self.task.abort();
        self.rx.close();
        while self.rx.recv().await.is_some() {
            // drained and dropped
        }
        let _ = self.task.await;
    }

    async fn pump<R>(reader: R, tx: mpsc::Sender<T>, expected: Arc<AtomicUsize>, max_message_size: u32)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = reader;
        loop {
            if expected.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            }
            expected.fetch_sub(1, Ordering::SeqCst);
            match wire::read_message::<_, T>(&mut reader, max_message_size).await {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        return;
                    }
                }
                Err(_) => {
                    debug!("input pump failed to read a message, shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;

    #[tokio::test]
    async fn delivers_anticipated_messages_in_order() {
        let (reader, mut writer) = tokio::io::duplex(65536);
        let mut input = AsyncInputStream::<u32>::new(reader, 8, 1024);
        for i in 0..5u32 {
            wire::write_message(&mut writer, &i, 1024).await.unwrap();
        }
        for i in 0..5u32 {
            input.anticipate();
            let got = input.read_anticipated(Duration::from_secs(1)).await.unwrap();
            assert_eq!(got, i);
        }
        input.abort().await;
    }

    #[tokio::test]
    async fn read_without_anticipation_times_out() {
        let (reader, _writer) = tokio::io::duplex(65536);
        let mut input = AsyncInputStream::<u32>::new(reader, 8, 1024);
        let err = input.read_anticipated(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ReconnectError::Timeout(_)));
    }
}
