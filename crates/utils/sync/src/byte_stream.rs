//! Bounded in-memory pipe of bytes between two tasks.
//!
//! The writer waits while the buffer is full, the reader waits while it is
//! empty. Closing lets the reader drain what is buffered and then observe end
//! of stream. Aborting fails the reader straight away.

use core::fmt::{self, Debug, Formatter};
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ByteStreamError {
    #[error("byte stream closed after {written} bytes of the write were accepted")]
    Closed { written: usize },
    #[error("write interrupted after {written} bytes were accepted")]
    Interrupted { written: usize },
    #[error("byte stream aborted: {reason}")]
    Aborted { reason: String },
}

struct Shared {
    capacity: usize,
    state: Mutex<Buffer>,
    readable: Notify,
    writable: Notify,
}

struct Buffer {
    bytes: VecDeque<u8>,
    closed: bool,
    failure: Option<String>,
}

impl Shared {
    fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
        }

        self.wake_all();
        true
    }

    fn abort(&self, reason: String) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.failure = Some(reason);
            state.bytes.clear();
        }

        self.wake_all();
        true
    }

    fn wake_all(&self) {
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

/// Creates a stream holding at most `capacity` bytes.
#[must_use]
pub fn byte_stream(capacity: usize) -> (ByteStreamWriter, ByteStreamReader) {
    byte_stream_with_cancel(capacity, CancellationToken::new())
}

/// Like [`byte_stream`], with a writer that gives up waiting for room once
/// `cancel` fires.
#[must_use]
pub fn byte_stream_with_cancel(
    capacity: usize,
    cancel: CancellationToken,
) -> (ByteStreamWriter, ByteStreamReader) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        capacity,
        state: Mutex::new(Buffer {
            bytes: VecDeque::with_capacity(capacity),
            closed: false,
            failure: None,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
    });

    let writer = ByteStreamWriter {
        shared: Arc::clone(&shared),
        cancel,
    };
    let reader = ByteStreamReader { shared };

    (writer, reader)
}

/// Write half. Dropping it without [`close`](Self::close) aborts the stream.
pub struct ByteStreamWriter {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl ByteStreamWriter {
    /// Appends all of `buf`, waiting for room as needed.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), ByteStreamError> {
        let mut offset = 0;

        while offset < buf.len() {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            let _registered = notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();

                if state.closed {
                    return Err(ByteStreamError::Closed { written: offset });
                }

                let room = self.shared.capacity.saturating_sub(state.bytes.len());

                if room > 0 {
                    let end = buf.len().min(offset + room);
                    state.bytes.extend(&buf[offset..end]);
                    offset = end;
                    drop(state);

                    self.shared.readable.notify_waiters();
                    continue;
                }
            }

            tokio::select! {
                () = &mut notified => {}
                () = self.cancel.cancelled() => {
                    return Err(ByteStreamError::Interrupted { written: offset });
                }
            }
        }

        Ok(())
    }

    /// Marks the end of data. Returns `false` if the stream was already closed.
    pub fn close(&self) -> bool {
        self.shared.close()
    }

    pub fn abort(&self, reason: impl Into<String>) -> bool {
        self.shared.abort(reason.into())
    }

    #[must_use]
    pub fn handle(&self) -> ByteStreamHandle {
        ByteStreamHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl Drop for ByteStreamWriter {
    fn drop(&mut self) {
        let _aborted = self.shared.abort("writer dropped before close".to_owned());
    }
}

/// Read half. Dropping it closes the stream so a blocked writer fails.
pub struct ByteStreamReader {
    shared: Arc<Shared>,
}

impl ByteStreamReader {
    /// Reads up to `buf.len()` bytes. `Ok(0)` means the stream was closed and
    /// fully drained.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ByteStreamError> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            let _registered = notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();

                if let Some(reason) = &state.failure {
                    return Err(ByteStreamError::Aborted {
                        reason: reason.clone(),
                    });
                }

                if !state.bytes.is_empty() {
                    let count = buf.len().min(state.bytes.len());
                    for (dst, src) in buf.iter_mut().zip(state.bytes.drain(..count)) {
                        *dst = src;
                    }
                    drop(state);

                    self.shared.writable.notify_waiters();
                    return Ok(count);
                }

                if state.closed {
                    return Ok(0);
                }
            }

            notified.await;
        }
    }

    pub fn close(&self) -> bool {
        self.shared.close()
    }

    pub fn abort(&self, reason: impl Into<String>) -> bool {
        self.shared.abort(reason.into())
    }

    #[must_use]
    pub fn handle(&self) -> ByteStreamHandle {
        ByteStreamHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().bytes.len()
    }
}

impl Drop for ByteStreamReader {
    fn drop(&mut self) {
        let _closed = self.shared.close();
    }
}

/// Lets a supervising task end a stream it does not own.
#[derive(Clone)]
pub struct ByteStreamHandle {
    shared: Arc<Shared>,
}

impl ByteStreamHandle {
    pub fn close(&self) -> bool {
        self.shared.close()
    }

    pub fn abort(&self, reason: impl Into<String>) -> bool {
        self.shared.abort(reason.into())
    }
}

impl Debug for ByteStreamWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStreamWriter")
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

impl Debug for ByteStreamReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStreamReader")
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

impl Debug for ByteStreamHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStreamHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_round_trip_larger_than_capacity() {
        let (mut writer, mut reader) = byte_stream(64);
        let payload: Vec<u8> = (0..10_000_u32).map(|i| (i % 251) as u8).collect();

        let expected = payload.clone();
        let producer = tokio::spawn(async move {
            for chunk in payload.chunks(100) {
                writer.write(chunk).await.unwrap();
            }
            assert!(writer.close(), "first close wins");
        });

        let mut received = Vec::new();
        let mut buf = [0_u8; 37];
        loop {
            let read = reader.read(&mut buf).await.unwrap();
            if read == 0 {
                break;
            }
            assert!(reader.buffered() <= 64, "buffer never exceeds capacity");
            received.extend_from_slice(&buf[..read]);
        }
        producer.await.unwrap();

        assert_eq!(received, expected, "bytes arrive complete and in order");
        assert_eq!(reader.read(&mut buf).await, Ok(0), "end of stream stays at end");
    }

    #[tokio::test]
    async fn test_writer_blocks_while_full() {
        let (mut writer, mut reader) = byte_stream(4);

        writer.write(b"Bela").await.unwrap();
        let blocked = timeout(Duration::from_millis(50), writer.write(b"!")).await;
        assert!(blocked.is_err(), "a full buffer holds the writer");

        let mut buf = [0_u8; 2];
        assert_eq!(reader.read(&mut buf).await, Ok(2), "reader drains two bytes");

        timeout(Duration::from_millis(50), writer.write(b"!"))
            .await
            .unwrap()
            .unwrap();
        assert!(writer.close(), "close after the last write");

        let mut rest = [0_u8; 8];
        assert_eq!(reader.read(&mut rest).await, Ok(3), "remaining bytes drain after close");
        assert_eq!(&rest[..3], b"la!", "drained bytes are in order");
        assert_eq!(reader.read(&mut rest).await, Ok(0), "then end of stream");
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (mut writer, reader) = byte_stream(16);

        assert!(reader.close(), "reader may close");
        assert!(!writer.close(), "close is idempotent");

        assert_eq!(
            writer.write(b"late").await,
            Err(ByteStreamError::Closed { written: 0 }),
            "writes after close fail"
        );
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocked_writer() {
        let cancel = CancellationToken::new();
        let (mut writer, _reader) = byte_stream_with_cancel(4, cancel.clone());

        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let result = writer.write(b"abcdefgh").await;
        canceller.await.unwrap();

        assert_eq!(
            result,
            Err(ByteStreamError::Interrupted { written: 4 }),
            "the interrupted write reports what it got in"
        );
    }

    #[tokio::test]
    async fn test_abort_fails_the_reader() {
        let (mut writer, mut reader) = byte_stream(16);
        writer.write(b"partial").await.unwrap();

        let handle = reader.handle();
        assert!(handle.abort("provider departed"), "abort closes the stream");

        let mut buf = [0_u8; 16];
        assert_eq!(
            reader.read(&mut buf).await,
            Err(ByteStreamError::Aborted {
                reason: "provider departed".to_owned()
            }),
            "the reader sees the failure, not end of stream"
        );
    }

    #[tokio::test]
    async fn test_dropping_reader_unblocks_writer() {
        let (mut writer, reader) = byte_stream(2);
        writer.write(b"ab").await.unwrap();

        let dropper = tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            drop(reader);
        });

        let result = writer.write(b"c").await;
        dropper.await.unwrap();

        assert_eq!(result, Err(ByteStreamError::Closed { written: 0 }), "writer is released");
    }

    #[tokio::test]
    async fn test_dropping_writer_without_close_is_a_failure() {
        let (writer, mut reader) = byte_stream(2);
        drop(writer);

        let mut buf = [0_u8; 2];
        assert!(
            matches!(reader.read(&mut buf).await, Err(ByteStreamError::Aborted { .. })),
            "an unfinished writer does not look like end of stream"
        );
    }
}
