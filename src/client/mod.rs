//! Client side of the downstream protocol.
//!
//! Used by the local half of a sync session to poll the remote tree and
//! fetch changed content through a tunnel.

use crate::archive;
use crate::error::{Result, SyncError};
use crate::protocol::{self as wire, empty_frame, read_frame, write_frame, MessageType, RawFrame};
use crate::snapshot::Change;
use crate::transport::TransportError;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

/// Paths sent per `PathList` frame
pub const PATH_BATCH_SIZE: usize = 64;

pub struct DownstreamClient<R, W> {
    reader: R,
    writer: W,
    server_version: u16,
}

impl<R, W> DownstreamClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Perform the `Hello` handshake.
    pub async fn connect(reader: R, writer: W) -> Result<Self> {
        let mut client = Self {
            reader,
            writer,
            server_version: 0,
        };

        write_frame(&mut client.writer, &wire::Hello::new().encode()).await?;
        let frame = client.next_frame().await?;
        match frame.message_type() {
            Some(MessageType::Hello) => {
                client.server_version = wire::Hello::decode(frame.payload)?.version;
                debug!("Connected, server protocol version {}", client.server_version);
                Ok(client)
            }
            _ => Err(unexpected(frame, "Hello")),
        }
    }

    pub fn server_version(&self) -> u16 {
        self.server_version
    }

    async fn next_frame(&mut self) -> Result<RawFrame> {
        Ok(read_frame(&mut self.reader)
            .await?
            .ok_or(TransportError::Closed)?)
    }

    /// Number of changes the server has pending. Does not consume them.
    pub async fn changes_count(&mut self) -> Result<i64> {
        write_frame(&mut self.writer, &empty_frame(MessageType::ChangesCountRequest)).await?;
        let frame = self.next_frame().await?;
        match frame.message_type() {
            Some(MessageType::ChangeAmount) => Ok(wire::ChangeAmount::decode(frame.payload)?.amount),
            _ => Err(unexpected(frame, "ChangeAmount")),
        }
    }

    /// Fetch every pending change. The server moves its baseline once the
    /// last chunk is out.
    pub async fn changes(&mut self) -> Result<Vec<Change>> {
        write_frame(&mut self.writer, &empty_frame(MessageType::ChangesRequest)).await?;

        let mut changes = Vec::new();
        loop {
            let frame = self.next_frame().await?;
            match frame.message_type() {
                Some(MessageType::ChangeChunk) => {
                    changes.extend(wire::ChangeChunk::decode(frame.payload)?.changes);
                }
                Some(MessageType::ChangesEnd) => {
                    let end = wire::ChangesEnd::decode(frame.payload)?;
                    if end.total != changes.len() as u64 {
                        return Err(SyncError::protocol(format!(
                            "Server announced {} changes, received {}",
                            end.total,
                            changes.len()
                        )));
                    }
                    return Ok(changes);
                }
                _ => return Err(unexpected(frame, "ChangeChunk")),
            }
        }
    }

    /// Download `paths` as a tar+gzip archive into `sink`.
    ///
    /// Paths are sent while the archive is already streaming back. Only a
    /// closing `DownloadEnd` marks the archive as complete; anything else
    /// fails the call. Returns the number of archive bytes received.
    pub async fn download<S>(&mut self, paths: &[String], sink: &mut S) -> Result<u64>
    where
        S: AsyncWrite + Unpin,
    {
        write_frame(&mut self.writer, &empty_frame(MessageType::DownloadRequest)).await?;

        let reader = &mut self.reader;
        let writer = &mut self.writer;

        let send = async move {
            for batch in paths.chunks(PATH_BATCH_SIZE) {
                let list = wire::PathList {
                    paths: batch.to_vec(),
                };
                write_frame(writer, &list.encode()?).await?;
            }
            write_frame(writer, &empty_frame(MessageType::PathListEnd)).await
        };

        let receive = async move {
            let mut received = 0u64;
            loop {
                let frame = read_frame(reader).await?.ok_or(TransportError::Closed)?;
                match frame.message_type() {
                    Some(MessageType::Chunk) => {
                        sink.write_all(&frame.payload).await?;
                        received += frame.payload.len() as u64;
                    }
                    Some(MessageType::DownloadEnd) => {
                        sink.flush().await?;
                        return Ok(received);
                    }
                    _ => return Err(unexpected(frame, "Chunk")),
                }
            }
        };

        let (sent, received) = tokio::join!(send, receive);
        let received = received?;
        sent?;

        debug!("Downloaded {} archive bytes for {} paths", received, paths.len());
        Ok(received)
    }

    /// Download `paths` and unpack them below `dest`. Returns the number of
    /// unpacked entries.
    pub async fn download_into(&mut self, paths: &[String], dest: &Path) -> Result<usize> {
        let mut buffer = Vec::new();
        self.download(paths, &mut buffer).await?;

        let dest = dest.to_path_buf();
        let unpacked =
            tokio::task::spawn_blocking(move || archive::extract(buffer.as_slice(), &dest))
                .await??;
        Ok(unpacked)
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

/// Map a frame that does not fit the current call to an error, surfacing
/// the message of a server-side `Error`.
fn unexpected(frame: RawFrame, expected: &str) -> SyncError {
    match frame.message_type() {
        Some(MessageType::Error) => match wire::Error::decode(frame.payload) {
            Ok(err) => SyncError::Remote(err.message),
            Err(e) => e,
        },
        Some(other) => SyncError::protocol(format!("Expected {}, got {:?}", expected, other)),
        None => SyncError::protocol(format!(
            "Expected {}, got unknown message type 0x{:02x}",
            expected, frame.msg_type
        )),
    }
}

/// A downstream server running as a child process, e.g. `devsync downstream`
/// executed inside a container.
pub struct RemoteSession {
    child: Child,
    client: DownstreamClient<ChildStdout, ChildStdin>,
}

impl RemoteSession {
    /// Spawn `command` with piped stdio and connect to it.
    pub async fn spawn(mut command: Command) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SyncError::Task("Failed to open child stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SyncError::Task("Failed to open child stdout".into()))?;

        let client = DownstreamClient::connect(stdout, stdin).await?;
        info!("Remote session started (pid {:?})", child.id());
        Ok(Self { child, client })
    }

    pub fn client(&mut self) -> &mut DownstreamClient<ChildStdout, ChildStdin> {
        &mut self.client
    }

    /// Close the tunnel and wait for the helper to exit.
    pub async fn close(self) -> Result<ExitStatus> {
        let RemoteSession { mut child, client } = self;
        // Closing stdin is the helper's signal to stop
        drop(client);
        let status = child.wait().await?;
        debug!("Remote session exited with {}", status);
        Ok(status)
    }
}
