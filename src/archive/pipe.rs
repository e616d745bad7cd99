//! Blocking writer feeding a bounded async channel.
//!
//! The archive encoder runs on a blocking thread and writes through a
//! [`PipeWriter`]; the session task drains the receiver. A full channel
//! blocks the encoder, which is the only backpressure the producer needs.
//!
//! Once its abort token is cancelled the writer refuses all further bytes,
//! so encoder trailers written while unwinding a failed archive never reach
//! the receiver.

use bytes::{Bytes, BytesMut};
use std::io::{self, Write};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Number of chunks buffered between the encoder and the sender
pub const PIPE_CAPACITY: usize = 8;

/// Create a pipe whose receiver yields chunks of exactly `chunk_size` bytes,
/// except for the last one.
pub fn pipe(
    capacity: usize,
    chunk_size: usize,
    abort: CancellationToken,
) -> (PipeWriter, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let chunk_size = chunk_size.max(1);
    (
        PipeWriter {
            tx,
            buf: BytesMut::with_capacity(chunk_size),
            chunk_size,
            abort,
        },
        rx,
    )
}

pub struct PipeWriter {
    tx: mpsc::Sender<Bytes>,
    buf: BytesMut,
    chunk_size: usize,
    abort: CancellationToken,
}

impl PipeWriter {
    fn send_buffered(&mut self) -> io::Result<()> {
        if self.abort.is_cancelled() {
            self.buf.clear();
            return Err(io::Error::new(io::ErrorKind::Other, "archive aborted"));
        }
        let chunk = self.buf.split().freeze();
        self.tx.blocking_send(chunk).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer went away")
        })
    }
}

impl Write for PipeWriter {
    /// Must not be called from an async context.
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.chunk_size - self.buf.len();
        let n = data.len().min(room);
        self.buf.extend_from_slice(&data[..n]);

        if self.buf.len() == self.chunk_size {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.send_buffered()?;
        }
        Ok(())
    }
}
