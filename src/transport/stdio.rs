//! Serve a single session over a pair of byte streams.
//!
//! State machine:
//!
//! ```text
//! Unbound --accept--> Listening --ready(joint)--> Ready --accept--> Bound
//!    |                    |                                           |
//!    +--------------------+------------- close / session end ---------+--> Closed
//! ```
//!
//! A tunnel has exactly one peer, so at most one session is ever handed out.
//! Further `accept` calls wait until the listener closes and then fail with
//! [`TransportError::Closed`].

use super::{BoxedReader, BoxedWriter, Connection, Transport, TransportError};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tracing::{debug, info};

/// The join point between the listener and the two streams of a tunnel.
pub struct StreamJoint {
    reader: BoxedReader,
    writer: BoxedWriter,
    exit_on_close: bool,
}

impl StreamJoint {
    /// With `exit_on_close`, the process exits as soon as the incoming stream
    /// reaches end-of-file.
    pub fn new<R, W>(reader: R, writer: W, exit_on_close: bool) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            exit_on_close,
        }
    }

    fn into_connection(self) -> Connection {
        let reader: BoxedReader = if self.exit_on_close {
            Box::new(ExitOnEof { inner: self.reader })
        } else {
            self.reader
        };
        Connection::new(reader, self.writer)
    }
}

impl std::fmt::Debug for StreamJoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamJoint")
            .field("exit_on_close", &self.exit_on_close)
            .finish()
    }
}

/// Terminates the process when the wrapped reader hits end-of-file.
struct ExitOnEof {
    inner: BoxedReader,
}

impl AsyncRead for ExitOnEof {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let has_room = buf.remaining() > 0;

        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if has_room && buf.filled().len() == before => {
                info!("Input stream closed, exiting");
                std::process::exit(0);
            }
            other => other,
        }
    }
}

enum State {
    Unbound,
    Listening,
    Ready(StreamJoint),
    Bound,
    Closed,
}

struct Shared {
    state: Mutex<State>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self) {
        let mut state = self.lock();
        if !matches!(*state, State::Closed) {
            debug!("Stdio listener closed");
        }
        *state = State::Closed;
        drop(state);
        self.changed.notify_waiters();
    }
}

/// A [`Transport`] that hands out exactly one session, built from the
/// [`StreamJoint`] passed to [`ready`](StdioListener::ready).
#[derive(Clone)]
pub struct StdioListener {
    shared: Arc<Shared>,
}

impl StdioListener {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Unbound),
                changed: Notify::new(),
            }),
        }
    }

    /// Make the streams available to the next (or a waiting) `accept`.
    pub fn ready(&self, joint: StreamJoint) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        match *state {
            State::Unbound | State::Listening => {
                debug!("Stream joint ready");
                *state = State::Ready(joint);
            }
            State::Ready(_) | State::Bound => return Err(TransportError::AlreadyBound),
            State::Closed => return Err(TransportError::Closed),
        }
        drop(state);
        self.shared.changed.notify_waiters();
        Ok(())
    }

    /// Stop serving. Waiting and future `accept` calls fail with
    /// [`TransportError::Closed`].
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.shared.lock(), State::Closed)
    }

    /// `None` means the caller has to wait for the next state change.
    fn try_accept(&self) -> Option<Result<Connection, TransportError>> {
        let mut state = self.shared.lock();
        match std::mem::replace(&mut *state, State::Closed) {
            State::Unbound | State::Listening => {
                *state = State::Listening;
                None
            }
            State::Ready(joint) => {
                *state = State::Bound;
                debug!("Session bound to stream joint");
                let shared = Arc::clone(&self.shared);
                Some(Ok(joint
                    .into_connection()
                    .with_close_hook(move || shared.close())))
            }
            State::Bound => {
                *state = State::Bound;
                None
            }
            State::Closed => Some(Err(TransportError::Closed)),
        }
    }
}

impl Default for StdioListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StdioListener {
    async fn accept(&self) -> Result<Connection, TransportError> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            // Register before inspecting the state so a concurrent
            // ready/close cannot slip between the check and the wait
            notified.as_mut().enable();

            if let Some(result) = self.try_accept() {
                return result;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    fn joint() -> (DuplexStream, StreamJoint) {
        let (client, server) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(server);
        (client, StreamJoint::new(reader, writer, false))
    }

    #[tokio::test]
    async fn test_accept_waits_for_ready() {
        let listener = StdioListener::new();

        let pending = timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(pending.is_err(), "accept must block before ready");

        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (_client, joint) = joint();
        listener.ready(joint).unwrap();

        let conn = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("accept should wake up")
            .unwrap();
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn test_ready_before_accept() {
        let listener = StdioListener::new();
        let (_client, joint) = joint();
        listener.ready(joint).unwrap();

        let conn = timeout(Duration::from_secs(1), listener.accept()).await;
        assert!(conn.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_connection_carries_bytes() {
        let listener = StdioListener::new();
        let (mut client, joint) = joint();
        listener.ready(joint).unwrap();
        let mut conn = listener.accept().await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let (reader, writer) = conn.halves();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        writer.write_all(b"pong").await.unwrap();
        writer.flush().await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_second_accept_never_gets_a_session() {
        let listener = StdioListener::new();
        let (_client, joint) = joint();
        listener.ready(joint).unwrap();
        let conn = listener.accept().await.unwrap();

        let second = timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(second.is_err(), "second accept must block while bound");

        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Ending the session closes the listener
        drop(conn);

        let result = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("accept should wake up on close")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(listener.is_closed());
    }

    #[tokio::test]
    async fn test_ready_twice_is_rejected() {
        let listener = StdioListener::new();
        let (_a, first) = joint();
        let (_b, second) = joint();

        listener.ready(first).unwrap();
        assert!(matches!(
            listener.ready(second),
            Err(TransportError::AlreadyBound)
        ));
    }

    #[tokio::test]
    async fn test_closed_listener() {
        let listener = StdioListener::new();
        listener.close();

        let (_client, joint) = joint();
        assert!(matches!(listener.ready(joint), Err(TransportError::Closed)));
        assert!(matches!(
            listener.accept().await,
            Err(TransportError::Closed)
        ));
    }
}
