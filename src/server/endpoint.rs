//! The downstream endpoint: change detection and content delivery for one
//! watched root.

use crate::archive::{ArchiveProducer, ArchiveStream};
use crate::config::DownstreamOptions;
use crate::error::Result;
use crate::snapshot::diff::CHANGE_CHUNK_SIZE;
use crate::snapshot::{count_changes, diff, walk, Change, ChangeChunks, IgnoreMatcher, Snapshot};
use std::path::Path;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Owns the baseline snapshot of the watched root.
///
/// The baseline only moves forward when a [`PendingChanges`] is committed,
/// which happens after its records were fully delivered.
pub struct Downstream {
    options: DownstreamOptions,
    matcher: Option<IgnoreMatcher>,
    producer: ArchiveProducer,
    baseline: Mutex<Option<Snapshot>>,
    shutdown: CancellationToken,
}

impl Downstream {
    /// Fails when an exclude pattern does not compile.
    pub fn new(options: DownstreamOptions) -> Result<Self> {
        let matcher = IgnoreMatcher::compile(&options.exclude_paths)?;
        let producer = ArchiveProducer::new(&options.remote_path, matcher.clone());

        info!(
            "Downstream endpoint for {} ({} exclude patterns)",
            options.remote_path.display(),
            options.exclude_paths.len()
        );

        Ok(Self {
            options,
            matcher,
            producer,
            baseline: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.options.remote_path
    }

    pub fn options(&self) -> &DownstreamOptions {
        &self.options
    }

    /// Token for a single call; cancelled when the endpoint shuts down.
    pub fn call_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Cancel every in-flight call.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn snapshot(&self, cancel: &CancellationToken) -> Result<Snapshot> {
        let root = self.options.remote_path.clone();
        let matcher = self.matcher.clone();
        let cancel = cancel.clone();

        let (snapshot, stats) =
            tokio::task::spawn_blocking(move || walk(&root, matcher.as_ref(), &cancel)).await??;

        debug!(
            "Snapshot: {} files, {} dirs, {} skipped",
            stats.files, stats.dirs, stats.skipped
        );
        Ok(snapshot)
    }

    /// Number of pending changes. Does not move the baseline.
    pub async fn changes_count(&self, cancel: &CancellationToken) -> Result<u64> {
        let current = self.snapshot(cancel).await?;
        let baseline = self.baseline.lock().await;
        let count = count_changes(baseline.as_ref(), &current);
        debug!("{} pending changes", count);
        Ok(count)
    }

    /// Walk the root and diff it against the baseline.
    ///
    /// The returned [`PendingChanges`] holds the baseline until it is
    /// committed or dropped, so overlapping calls are serialized.
    pub async fn changes(&self, cancel: &CancellationToken) -> Result<PendingChanges<'_>> {
        let baseline = self.baseline.lock().await;
        let current = self.snapshot(cancel).await?;
        Ok(PendingChanges {
            root: self.root(),
            baseline,
            current,
        })
    }

    /// Archive every path received on `paths`, relative to the root.
    pub fn download(&self, paths: mpsc::Receiver<String>, cancel: CancellationToken) -> ArchiveStream {
        self.producer.spawn(paths, cancel)
    }
}

/// A computed diff waiting to be delivered.
pub struct PendingChanges<'a> {
    root: &'a Path,
    baseline: MutexGuard<'a, Option<Snapshot>>,
    current: Snapshot,
}

impl PendingChanges<'_> {
    pub fn total(&self) -> u64 {
        count_changes((*self.baseline).as_ref(), &self.current)
    }

    pub fn chunks(&self) -> ChangeChunks<impl Iterator<Item = Change> + '_> {
        ChangeChunks::new(
            diff(self.root, (*self.baseline).as_ref(), &self.current),
            CHANGE_CHUNK_SIZE,
        )
    }

    /// Make the walked snapshot the new baseline.
    pub fn commit(self) {
        let PendingChanges {
            mut baseline,
            current,
            ..
        } = self;
        debug!("Baseline advanced to {} entries", current.len());
        *baseline = Some(current);
    }
}
