//! Connection-oriented transports for the downstream server.
//!
//! The server only needs `accept() -> Connection`; where the bytes come from
//! (the stdio of an exec'd helper, an in-memory duplex in tests) is the
//! transport's business.

pub mod stdio;

pub use stdio::{StdioListener, StreamJoint};

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Transport already has a bound session")]
    AlreadyBound,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Something the server can accept sessions from.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait for the next session. Returns [`TransportError::Closed`] once the
    /// transport will never produce another one.
    async fn accept(&self) -> Result<Connection, TransportError>;
}

/// One accepted session: buffered read and write halves, and an optional
/// hook run when the session is dropped.
pub struct Connection {
    reader: BufReader<BoxedReader>,
    writer: BufWriter<BoxedWriter>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Connection {
    pub fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            on_close: None,
        }
    }

    pub(crate) fn with_close_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn halves(&mut self) -> (&mut BufReader<BoxedReader>, &mut BufWriter<BoxedWriter>) {
        (&mut self.reader, &mut self.writer)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("has_close_hook", &self.on_close.is_some())
            .finish()
    }
}
