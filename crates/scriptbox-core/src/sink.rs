//! Per-session output sink.
//!
//! Single producer (the worker thread), single consumer (whoever subscribed).
//! The channel is bounded: a producer that outruns its consumer blocks until
//! there is room or the session is cancelled.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::session::{lock, CancelToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One piece of emitted text. `seq` increases strictly per sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub text: String,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("output sink is closed")]
    Closed,

    #[error("session was cancelled")]
    Cancelled,

    #[error("output limit of {limit} bytes exceeded")]
    LimitExceeded { limit: u64 },

    #[error("output subscriber disconnected")]
    Disconnected,
}

/// Producer side of a session's output.
#[derive(Debug)]
pub struct OutputSink {
    tx: Mutex<Option<mpsc::Sender<OutputChunk>>>,
    closed: AtomicBool,
    next_seq: AtomicU64,
    bytes_written: AtomicU64,
    max_bytes: Option<u64>,
    cancel: CancelToken,
    handle: Handle,
}

/// Create a sink/stream pair.
///
/// `handle` is the runtime the blocking producer parks on when the buffer is
/// full; `write` must not be called from inside an async task.
pub fn channel(
    capacity: usize,
    max_bytes: Option<u64>,
    cancel: CancelToken,
    handle: Handle,
) -> (OutputSink, OutputStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = OutputSink {
        tx: Mutex::new(Some(tx)),
        closed: AtomicBool::new(false),
        next_seq: AtomicU64::new(0),
        bytes_written: AtomicU64::new(0),
        max_bytes,
        cancel,
        handle,
    };
    (sink, OutputStream { rx })
}

impl OutputSink {
    /// Append one chunk, blocking while the buffer is full.
    pub fn write(&self, stream: StreamKind, text: impl Into<String>) -> Result<(), SinkError> {
        if self.cancel.is_requested() {
            return Err(SinkError::Cancelled);
        }
        let tx = lock(&self.tx).clone().ok_or(SinkError::Closed)?;

        let text = text.into();
        let len = text.len() as u64;
        let total = self.bytes_written.fetch_add(len, Ordering::SeqCst) + len;
        if let Some(limit) = self.max_bytes {
            if total > limit {
                return Err(SinkError::LimitExceeded { limit });
            }
        }

        let chunk = OutputChunk {
            stream,
            text,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };

        match tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(SinkError::Disconnected),
            Err(TrySendError::Full(chunk)) => {
                let cancel = self.cancel.clone();
                self.handle.block_on(async move {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(SinkError::Cancelled),
                        sent = tx.send(chunk) => sent.map_err(|_| SinkError::Disconnected),
                    }
                })
            }
        }
    }

    /// Stop accepting writes. Chunks already buffered are still delivered,
    /// then the stream ends. Idempotent.
    pub fn close(&self) {
        lock(&self.tx).take();
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }
}

/// Subscriber side: a finite, ordered sequence of chunks that ends when the
/// session terminates.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::Receiver<OutputChunk>,
}

impl OutputStream {
    pub async fn next_chunk(&mut self) -> Option<OutputChunk> {
        self.rx.recv().await
    }

    /// For consumers outside the async runtime.
    pub fn blocking_next(&mut self) -> Option<OutputChunk> {
        self.rx.blocking_recv()
    }

    pub fn into_blocking_iter(mut self) -> impl Iterator<Item = OutputChunk> {
        std::iter::from_fn(move || self.rx.blocking_recv())
    }

    /// Drain the stream to its end.
    pub async fn collect_all(mut self) -> Vec<OutputChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }
}

impl Stream for OutputStream {
    type Item = OutputChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn pair(capacity: usize, max_bytes: Option<u64>) -> (OutputSink, OutputStream, CancelToken) {
        let cancel = CancelToken::new();
        let (sink, stream) = channel(capacity, max_bytes, cancel.clone(), Handle::current());
        (sink, stream, cancel)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_order_preserved_under_backpressure() {
        let (sink, mut stream, _) = pair(2, None);
        let producer = tokio::task::spawn_blocking(move || {
            for i in 0..50 {
                sink.write(StreamKind::Stdout, format!("{i}\n")).unwrap();
            }
            sink.close();
        });

        let mut seen = Vec::new();
        while let Some(chunk) = stream.next().await {
            if seen.len() % 10 == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            seen.push(chunk);
        }
        producer.await.unwrap();

        assert_eq!(seen.len(), 50);
        for (i, chunk) in seen.iter().enumerate() {
            assert_eq!(chunk.seq, i as u64);
            assert_eq!(chunk.text, format!("{i}\n"));
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ends_stream() {
        let (sink, stream, _) = pair(4, None);
        sink.write(StreamKind::Stdout, "a").unwrap();
        sink.close();
        sink.close();
        assert!(sink.is_closed());
        assert_eq!(sink.write(StreamKind::Stdout, "b"), Err(SinkError::Closed));

        let chunks = stream.collect_all().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "a");
    }

    #[tokio::test]
    async fn test_write_after_cancel_fails() {
        let (sink, _stream, cancel) = pair(4, None);
        cancel.request();
        assert_eq!(sink.write(StreamKind::Stdout, "x"), Err(SinkError::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocked_producer_wakes_on_cancel() {
        let (sink, _stream, cancel) = pair(1, None);
        let producer = tokio::task::spawn_blocking(move || {
            sink.write(StreamKind::Stdout, "fills buffer").unwrap();
            sink.write(StreamKind::Stdout, "blocks")
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.request();
        let outcome = tokio::time::timeout(Duration::from_secs(2), producer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Err(SinkError::Cancelled));
    }

    #[tokio::test]
    async fn test_output_limit() {
        let (sink, _stream, _) = pair(16, Some(8));
        sink.write(StreamKind::Stdout, "12345").unwrap();
        assert_eq!(
            sink.write(StreamKind::Stdout, "6789"),
            Err(SinkError::LimitExceeded { limit: 8 })
        );
    }

    #[tokio::test]
    async fn test_dropped_subscriber_reports_disconnect() {
        let (sink, stream, _) = pair(4, None);
        drop(stream);
        assert_eq!(
            sink.write(StreamKind::Stderr, "lost"),
            Err(SinkError::Disconnected)
        );
    }
}
