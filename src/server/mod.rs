//! Downstream server - serves a [`Downstream`] endpoint over any [`Transport`].
//!
//! Runs when invoked as `devsync downstream <path>`, usually as the helper
//! process at the far end of a container exec, with the tunnel on its stdio.
//!
//! Calls are handled one at a time per session. A failed call is answered
//! with an `Error` frame and the session goes on; only transport failures
//! end it.

pub mod endpoint;

pub use endpoint::{Downstream, PendingChanges};

use crate::config::DownstreamOptions;
use crate::error::{Result, SyncError};
use crate::protocol::{
    self as wire, empty_frame, negotiate_version, read_frame, write_frame, MessageType, RawFrame,
    VersionNegotiationResult,
};
use crate::transport::{Connection, StdioListener, StreamJoint, Transport, TransportError};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Requested paths buffered between the session and the archive producer
const PATH_QUEUE_SIZE: usize = 256;

/// Accept sessions until the transport closes, then wait for the running
/// sessions to finish.
pub async fn serve<T: Transport + ?Sized>(transport: &T, endpoint: Arc<Downstream>) -> Result<()> {
    let mut sessions = JoinSet::new();

    let outcome = loop {
        match transport.accept().await {
            Ok(conn) => {
                info!("Session accepted");
                let endpoint = Arc::clone(&endpoint);
                sessions.spawn(async move { run_session(conn, endpoint).await });
            }
            Err(TransportError::Closed) => {
                debug!("Transport closed, no more sessions");
                break Ok(());
            }
            Err(e) => break Err(e.into()),
        }
    };

    // Nothing can be served any more; stop the walks still running
    endpoint.shutdown();

    while let Some(joined) = sessions.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Session ended: {}", e),
            Err(e) => warn!("Session task failed: {}", e),
        }
    }

    outcome
}

/// Serve the downstream endpoint over one pair of streams until the peer
/// goes away. With `exit_on_close` set, the process exits once `reader`
/// reaches end-of-file.
pub async fn run_downstream<R, W>(reader: R, writer: W, options: DownstreamOptions) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let endpoint = Arc::new(Downstream::new(options)?);
    let joint = StreamJoint::new(reader, writer, endpoint.options().exit_on_close);
    let listener = StdioListener::new();

    let server = {
        let listener = listener.clone();
        let endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move { serve(&listener, endpoint).await })
    };

    listener.ready(joint)?;
    server.await?
}

async fn run_session(mut conn: Connection, endpoint: Arc<Downstream>) -> Result<()> {
    let (reader, writer) = conn.halves();

    loop {
        let Some(frame) = read_frame(reader).await? else {
            info!("Peer closed the session");
            return Ok(());
        };

        match dispatch(&endpoint, frame, reader, writer).await {
            Ok(()) => {}
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => {
                warn!("Call failed: {}", e);
                write_frame(writer, &wire::Error::new(e.to_string()).encode()).await?;
            }
        }
    }
}

async fn dispatch<R, W>(
    endpoint: &Downstream,
    frame: RawFrame,
    reader: &mut R,
    writer: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(msg_type) = frame.message_type() else {
        return Err(SyncError::protocol(format!(
            "Unknown message type 0x{:02x}",
            frame.msg_type
        )));
    };

    match msg_type {
        MessageType::Hello => {
            let hello = wire::Hello::decode(frame.payload)?;
            match negotiate_version(hello.version) {
                VersionNegotiationResult::Supported(version) => {
                    debug!("Negotiated protocol version {}", version);
                    write_frame(writer, &wire::Hello { version }.encode()).await
                }
                unsupported => Err(SyncError::protocol(format!(
                    "Unsupported protocol version: {:?}",
                    unsupported
                ))),
            }
        }
        MessageType::ChangesCountRequest => {
            let cancel = endpoint.call_token();
            let _guard = cancel.clone().drop_guard();

            let count = until_hangup(reader, &cancel, endpoint.changes_count(&cancel)).await?;
            let amount = i64::try_from(count).unwrap_or(i64::MAX);
            write_frame(writer, &wire::ChangeAmount { amount }.encode()).await
        }
        MessageType::ChangesRequest => send_changes(endpoint, reader, writer).await,
        MessageType::DownloadRequest => download(endpoint, reader, writer).await,
        other => Err(SyncError::protocol(format!(
            "Unexpected {:?} outside of a call",
            other
        ))),
    }
}

/// Run `call` while watching the read half. A peer that hangs up before the
/// call finishes gets its call cancelled, and the session ends.
async fn until_hangup<R, F, T>(reader: &mut R, cancel: &CancellationToken, call: F) -> Result<T>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        result = call => result,
        () = hangup(reader) => {
            info!("Peer hung up during a call, cancelling it");
            cancel.cancel();
            Err(TransportError::Closed.into())
        }
    }
}

/// Resolves once `reader` reaches end-of-file or fails. Buffered bytes are
/// the next request and keep it pending.
async fn hangup<R: AsyncBufRead + Unpin>(reader: &mut R) {
    match reader.fill_buf().await {
        Ok(buf) if !buf.is_empty() => std::future::pending::<()>().await,
        Ok(_) => {}
        Err(e) => debug!("Read half failed during a call: {}", e),
    }
}

async fn send_changes<R, W>(endpoint: &Downstream, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cancel = endpoint.call_token();
    let _guard = cancel.clone().drop_guard();

    let pending = until_hangup(reader, &cancel, endpoint.changes(&cancel)).await?;
    let mut total = 0u64;
    for changes in pending.chunks() {
        total += changes.len() as u64;
        write_frame(writer, &wire::ChangeChunk { changes }.encode()?).await?;
    }
    write_frame(writer, &wire::ChangesEnd { total }.encode()).await?;

    // Every record is on the wire
    pending.commit();
    info!("Sent {} changes", total);
    Ok(())
}

async fn download<R, W>(endpoint: &Downstream, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cancel = endpoint.call_token();
    let _guard = cancel.clone().drop_guard();

    let (path_tx, path_rx) = mpsc::channel(PATH_QUEUE_SIZE);
    let mut archive = endpoint.download(path_rx, cancel.child_token());

    let receive = async {
        let mut path_tx = Some(path_tx);
        let result = receive_paths(reader, &mut path_tx).await;
        // Closing the queue tells the producer the request is complete
        drop(path_tx);
        if result.is_err() {
            cancel.cancel();
        }
        result
    };

    let send = async {
        let mut sent = 0u64;
        while let Some(chunk) = archive.next_chunk().await {
            let content = chunk?;
            sent += content.len() as u64;
            write_frame(writer, &wire::Chunk { content }.encode()).await?;
        }
        Ok::<_, SyncError>(sent)
    };

    let (received, sent) = tokio::join!(receive, send);
    let requested = received?;
    let sent = sent?;

    write_frame(writer, &empty_frame(MessageType::DownloadEnd)).await?;

    if let Some(stats) = archive.stats() {
        info!(
            "Download complete: {} paths requested, {} entries, {} bytes sent",
            requested, stats.entries, sent
        );
    }
    Ok(())
}

/// Read `PathList` frames up to `PathListEnd`, forwarding each path the
/// first time it is seen. Once the producer stops taking paths the rest of
/// the request is still read so the session stays in step.
async fn receive_paths<R: AsyncRead + Unpin>(
    reader: &mut R,
    path_tx: &mut Option<mpsc::Sender<String>>,
) -> Result<u64> {
    let mut queued = HashSet::new();

    loop {
        let frame = read_frame(reader).await?.ok_or(TransportError::Closed)?;
        match frame.message_type() {
            Some(MessageType::PathList) => {
                let list = wire::PathList::decode(frame.payload)?;
                for path in list.paths {
                    if !queued.insert(path.clone()) {
                        continue;
                    }
                    let delivered = match path_tx {
                        Some(tx) => tx.send(path).await.is_ok(),
                        None => true,
                    };
                    if !delivered {
                        *path_tx = None;
                    }
                }
            }
            Some(MessageType::PathListEnd) => return Ok(queued.len() as u64),
            _ => {
                return Err(SyncError::protocol(format!(
                    "Unexpected message type 0x{:02x} during download",
                    frame.msg_type
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_hangup_cancels_running_walk() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = BufReader::new(server);
        let cancel = CancellationToken::new();

        // Stands in for a walk on the blocking pool that checks its token
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let token = cancel.clone();
        let walk = async move {
            tokio::task::spawn_blocking(move || {
                while !token.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                let _ = stopped_tx.send(());
                Err::<u64, _>(SyncError::Cancelled)
            })
            .await?
        };

        let call = tokio::spawn(async move { until_hangup(&mut reader, &cancel, walk).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(client);

        let result = timeout(Duration::from_secs(1), call)
            .await
            .expect("call should end on hangup")
            .unwrap();
        assert!(result.unwrap_err().is_transport());
        timeout(Duration::from_secs(1), stopped_rx)
            .await
            .expect("walk should stop once the peer is gone")
            .unwrap();
    }

    #[tokio::test]
    async fn test_queued_request_is_not_a_hangup() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = BufReader::new(server);
        let cancel = CancellationToken::new();

        client
            .write_all(&empty_frame(MessageType::ChangesCountRequest))
            .await
            .unwrap();

        let call = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, SyncError>(7u64)
        };
        assert_eq!(until_hangup(&mut reader, &cancel, call).await.unwrap(), 7);
        assert!(!cancel.is_cancelled());

        // The queued request is still there to be read
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame.message_type(), Some(MessageType::ChangesCountRequest));
    }

    #[tokio::test]
    async fn test_closed_transport_shuts_down_endpoint() {
        let tmp = TempDir::new().unwrap();
        let endpoint = Arc::new(Downstream::new(DownstreamOptions::new(tmp.path())).unwrap());
        let listener = StdioListener::new();
        listener.close();

        serve(&listener, Arc::clone(&endpoint)).await.unwrap();
        assert!(endpoint.call_token().is_cancelled());
    }
}
