//! Streaming tar+gzip producer.
//!
//! Requested paths arrive on a channel while the archive is already being
//! written; the encoder runs on a blocking thread and its output is relayed
//! through a bounded [`pipe`](super::pipe).

use crate::archive::pipe::{pipe, PipeWriter, PIPE_CAPACITY};
use crate::error::{Result, SyncError};
use crate::snapshot::IgnoreMatcher;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Builder, HeaderMode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Size of the chunks an [`ArchiveStream`] yields
pub const ARCHIVE_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Entries written, directories and symlinks included
    pub entries: u64,
    /// Sum of the archived regular files' sizes
    pub bytes: u64,
}

/// Archives paths relative to a root, skipping excluded descendants of
/// requested directories.
#[derive(Debug, Clone)]
pub struct ArchiveProducer {
    root: PathBuf,
    matcher: Option<IgnoreMatcher>,
}

impl ArchiveProducer {
    pub fn new(root: impl Into<PathBuf>, matcher: Option<IgnoreMatcher>) -> Self {
        Self {
            root: root.into(),
            matcher,
        }
    }

    /// Start producing an archive of every path received on `paths`.
    ///
    /// The archive is finished once the path sender is dropped. Cancelling
    /// `cancel` stops the producer at the next entry.
    pub fn spawn(&self, paths: mpsc::Receiver<String>, cancel: CancellationToken) -> ArchiveStream {
        let abort = cancel.child_token();
        let (writer, rx) = pipe(PIPE_CAPACITY, ARCHIVE_CHUNK_SIZE, abort.clone());

        let root = self.root.clone();
        let matcher = self.matcher.clone();
        let task = tokio::task::spawn_blocking(move || {
            write_archive(&root, matcher.as_ref(), paths, writer, &abort)
        });

        ArchiveStream {
            rx,
            task: Some(task),
            cancel,
            stats: None,
        }
    }

    /// Archive a fixed list of paths.
    pub fn produce(&self, paths: Vec<String>, cancel: CancellationToken) -> ArchiveStream {
        let (tx, rx) = mpsc::channel(paths.len().max(1));
        for path in paths {
            // Capacity covers every path
            if tx.try_send(path).is_err() {
                break;
            }
        }
        self.spawn(rx, cancel)
    }
}

/// Consumer side of a running archive.
///
/// Dropping the stream cancels the producer.
pub struct ArchiveStream {
    rx: mpsc::Receiver<Bytes>,
    task: Option<JoinHandle<Result<ArchiveStats>>>,
    cancel: CancellationToken,
    stats: Option<ArchiveStats>,
}

impl ArchiveStream {
    /// Next chunk of archive bytes, at most [`ARCHIVE_CHUNK_SIZE`] long.
    ///
    /// Returns `None` once the archive is complete. A producer failure is
    /// returned after the bytes written before it, and the stream ends there.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        if let Some(chunk) = self.rx.recv().await {
            return Some(Ok(chunk));
        }

        let task = self.task.take()?;
        match task.await {
            Ok(Ok(stats)) => {
                self.stats = Some(stats);
                None
            }
            Ok(Err(e)) => Some(Err(e)),
            Err(e) => Some(Err(e.into())),
        }
    }

    /// Totals of a completed archive.
    pub fn stats(&self) -> Option<ArchiveStats> {
        self.stats
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ArchiveStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Turn a requested path into a clean relative path below the root.
pub(crate) fn sanitize_request(requested: &str) -> Result<PathBuf> {
    if requested.is_empty() {
        return Err(SyncError::protocol("Empty path not allowed"));
    }

    let mut clean = PathBuf::new();
    for component in Path::new(requested).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::RootDir => {
                return Err(SyncError::protocol(format!(
                    "Absolute paths not allowed: {}",
                    requested
                )))
            }
            Component::ParentDir => {
                return Err(SyncError::protocol(format!(
                    "Path traversal not allowed: {}",
                    requested
                )))
            }
            Component::Prefix(_) => {
                return Err(SyncError::protocol(format!(
                    "Prefix paths not allowed: {}",
                    requested
                )))
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(SyncError::protocol(format!(
            "Path names no entry: {}",
            requested
        )));
    }
    Ok(clean)
}

fn write_archive(
    root: &Path,
    matcher: Option<&IgnoreMatcher>,
    mut paths: mpsc::Receiver<String>,
    writer: PipeWriter,
    abort: &CancellationToken,
) -> Result<ArchiveStats> {
    let mut builder = Builder::new(GzEncoder::new(writer, Compression::default()));
    builder.follow_symlinks(false);
    builder.mode(HeaderMode::Complete);

    let mut archiver = Archiver {
        root,
        matcher,
        builder: &mut builder,
        written: HashSet::new(),
        stats: ArchiveStats::default(),
        cancel: abort,
    };

    let stats = match archiver.append_requests(&mut paths) {
        Ok(stats) => stats,
        Err(e) => {
            warn!("Archive aborted: {}", e);
            // Keep the trailers written on drop off the wire
            abort.cancel();
            return Err(e);
        }
    };

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;

    debug!(
        "Archived {} entries ({} bytes) from {}",
        stats.entries,
        stats.bytes,
        root.display()
    );
    Ok(stats)
}

struct Archiver<'a, W: Write> {
    root: &'a Path,
    matcher: Option<&'a IgnoreMatcher>,
    builder: &'a mut Builder<W>,
    /// Relative paths already in the archive
    written: HashSet<PathBuf>,
    stats: ArchiveStats,
    cancel: &'a CancellationToken,
}

impl<W: Write> Archiver<'_, W> {
    fn append_requests(&mut self, paths: &mut mpsc::Receiver<String>) -> Result<ArchiveStats> {
        while let Some(requested) = paths.blocking_recv() {
            let relative = sanitize_request(&requested)?;
            self.append_tree(&relative)?;
        }
        // The request stream may have been cut short
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(self.stats)
    }

    fn append_tree(&mut self, relative: &Path) -> Result<()> {
        if !self.written.insert(relative.to_path_buf()) {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let full = self.root.join(relative);
        let archive_err = |source: io::Error| SyncError::Archive {
            path: relative.to_path_buf(),
            source,
        };

        let metadata = fs::symlink_metadata(&full).map_err(archive_err)?;
        self.builder
            .append_path_with_name(&full, relative)
            .map_err(archive_err)?;

        self.stats.entries += 1;
        if metadata.is_file() {
            self.stats.bytes += metadata.len();
        }

        if !metadata.is_dir() {
            return Ok(());
        }

        let mut children = fs::read_dir(&full)
            .and_then(|entries| entries.collect::<io::Result<Vec<_>>>())
            .map_err(archive_err)?;
        children.sort_by_key(|entry| entry.file_name());

        for child in children {
            let child_relative = relative.join(child.file_name());
            let is_dir = child.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if let Some(matcher) = self.matcher {
                if matcher.matches(&child_relative, is_dir) {
                    continue;
                }
            }
            self.append_tree(&child_relative)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    async fn collect(mut stream: ArchiveStream) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next_chunk().await {
            let chunk = chunk?;
            assert!(chunk.len() <= ARCHIVE_CHUNK_SIZE);
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    fn entry_names(archive: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(archive));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                path.trim_end_matches('/').to_string()
            })
            .collect()
    }

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();
        fs::write(tmp.path().join("d/a.txt"), "alpha").unwrap();
        fs::write(tmp.path().join("d/b.log"), "log").unwrap();
        fs::write(tmp.path().join("top.txt"), "top").unwrap();
        tmp
    }

    fn paths(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn test_directories_are_recursed() {
        let tmp = tree();
        let producer = ArchiveProducer::new(tmp.path(), None);

        let bytes = collect(producer.produce(paths(&["d"]), CancellationToken::new()))
            .await
            .unwrap();

        assert_eq!(entry_names(&bytes), vec!["d", "d/a.txt", "d/b.log"]);
    }

    #[tokio::test]
    async fn test_duplicate_requests_are_archived_once() {
        let tmp = tree();
        let producer = ArchiveProducer::new(tmp.path(), None);

        let mut stream = producer.produce(
            paths(&["d/a.txt", "d", "./d", "top.txt", "top.txt"]),
            CancellationToken::new(),
        );
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next_chunk().await {
            bytes.extend_from_slice(&chunk.unwrap());
        }

        let names = entry_names(&bytes);
        assert_eq!(names, vec!["d/a.txt", "d", "d/b.log", "top.txt"]);
        assert_eq!(
            stream.stats(),
            Some(ArchiveStats {
                entries: 4,
                bytes: 5 + 3 + 3
            })
        );
    }

    #[tokio::test]
    async fn test_excluded_descendants_are_skipped() {
        let tmp = tree();
        let matcher = IgnoreMatcher::compile(&["*.log"]).unwrap();
        let producer = ArchiveProducer::new(tmp.path(), matcher);

        let bytes = collect(producer.produce(paths(&["d"]), CancellationToken::new()))
            .await
            .unwrap();

        assert_eq!(entry_names(&bytes), vec!["d", "d/a.txt"]);
    }

    #[tokio::test]
    async fn test_missing_path_fails_the_stream() {
        let tmp = tree();
        let producer = ArchiveProducer::new(tmp.path(), None);

        let err = collect(producer.produce(paths(&["top.txt", "gone.txt"]), CancellationToken::new()))
            .await
            .unwrap_err();

        match err {
            SyncError::Archive { path, .. } => assert_eq!(path, PathBuf::from("gone.txt")),
            other => panic!("Expected Archive error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_path_outside_root_is_refused() {
        let tmp = tree();
        let producer = ArchiveProducer::new(tmp.path(), None);

        let err = collect(producer.produce(paths(&["../etc/passwd"]), CancellationToken::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_cancelled_producer_stops() {
        let tmp = tree();
        let producer = ArchiveProducer::new(tmp.path(), None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = collect(producer.produce(paths(&["d"]), cancel))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlinks_are_kept_as_links() {
        let tmp = tree();
        std::os::unix::fs::symlink("d", tmp.path().join("link")).unwrap();
        let producer = ArchiveProducer::new(tmp.path(), None);

        let bytes = collect(producer.produce(paths(&["link"]), CancellationToken::new()))
            .await
            .unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let mut count = 0;
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            assert!(entry.header().entry_type().is_symlink());
            assert_eq!(
                entry.link_name().unwrap().unwrap().to_string_lossy(),
                "d"
            );
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn test_sanitize_request() {
        assert_eq!(sanitize_request("a/./b").unwrap(), PathBuf::from("a/b"));
        assert!(sanitize_request("").is_err());
        assert!(sanitize_request(".").is_err());
        assert!(sanitize_request("/etc").is_err());
        assert!(sanitize_request("a/../../b").is_err());
    }
}
