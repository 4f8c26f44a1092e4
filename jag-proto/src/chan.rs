//! Bounded byte channel exposed as an [`AsyncRead`] stream.
//!
//! The producer pushes chunks (or a terminal error); the consumer reads them
//! back as a contiguous byte stream. Dropping every [`ChanWriter`] ends the
//! stream with EOF.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Creates a channel buffering up to `capacity` chunks.
pub fn channel(capacity: usize) -> (ChanWriter, ChanReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ChanWriter { tx },
        ChanReader {
            rx,
            pending: Vec::new(),
            pos: 0,
            done: false,
        },
    )
}

/// Outcome of a non-waiting [`ChanWriter::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// The chunk was queued.
    Sent,
    /// The queue is full; the chunk was not queued.
    Full,
    /// The reader is gone.
    Closed,
}

/// Producer half of a byte channel.
#[derive(Debug, Clone)]
pub struct ChanWriter {
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
}

impl ChanWriter {
    /// Pushes a chunk; returns `false` once the reader is gone.
    pub async fn send(&self, chunk: Vec<u8>) -> bool {
        if chunk.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    /// Blocking variant of [`send`](Self::send) for use from OS threads.
    pub fn blocking_send(&self, chunk: Vec<u8>) -> bool {
        if chunk.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.blocking_send(Ok(chunk)).is_ok()
    }

    /// Queues a chunk without waiting for room.
    pub fn offer(&self, chunk: Vec<u8>) -> Offer {
        if chunk.is_empty() {
            return if self.tx.is_closed() { Offer::Closed } else { Offer::Sent };
        }
        self.try_push(Ok(chunk))
    }

    /// Queues a terminal error without waiting for room.
    pub fn offer_error(&self, err: io::Error) -> Offer {
        self.try_push(Err(err))
    }

    fn try_push(&self, item: io::Result<Vec<u8>>) -> Offer {
        match self.tx.try_send(item) {
            Ok(()) => Offer::Sent,
            Err(TrySendError::Full(_)) => Offer::Full,
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Delivers a terminal error to the reader.
    pub async fn fail(&self, err: io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }

    /// Blocking variant of [`fail`](Self::fail).
    pub fn blocking_fail(&self, err: io::Error) {
        let _ = self.tx.blocking_send(Err(err));
    }

    /// Returns `true` once the reader has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a byte channel.
#[derive(Debug)]
pub struct ChanReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    pos: usize,
    done: bool,
}

impl ChanReader {
    /// Returns `true` if bytes can be read right now without waiting.
    pub fn has_data(&self) -> bool {
        self.pos < self.pending.len() || (!self.done && !self.rx.is_empty())
    }
}

impl AsyncRead for ChanReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        while this.pos >= this.pending.len() {
            if this.done {
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.pending = chunk;
                    this.pos = 0;
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Err(e));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = buf.remaining().min(this.pending.len() - this.pos);
        buf.put_slice(&this.pending[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn chunks_read_back_in_order() {
        let (tx, mut rx) = channel(4);
        assert!(!rx.has_data());
        assert!(tx.send(b"hello ".to_vec()).await);
        assert!(tx.send(b"world".to_vec()).await);
        assert!(rx.has_data());
        drop(tx);

        let mut out = String::new();
        rx.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
        assert!(!rx.has_data());
    }

    #[tokio::test]
    async fn error_then_eof() {
        let (tx, mut rx) = channel(4);
        tx.fail(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).await;
        let mut buf = [0u8; 8];
        let err = rx.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(rx.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn offer_reports_full_and_closed() {
        let (tx, rx) = channel(1);
        assert_eq!(tx.offer(b"a".to_vec()), Offer::Sent);
        assert_eq!(tx.offer(b"b".to_vec()), Offer::Full);
        drop(rx);
        assert_eq!(tx.offer(b"c".to_vec()), Offer::Closed);
        assert_eq!(tx.offer(Vec::new()), Offer::Closed);
    }

    #[tokio::test]
    async fn small_reads_split_chunks() {
        let (tx, mut rx) = channel(1);
        tx.send(b"abcdef".to_vec()).await;
        let mut buf = [0u8; 4];
        assert_eq!(rx.read(&mut buf).await.unwrap(), 4);
        assert!(rx.has_data());
        assert_eq!(rx.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }
}
