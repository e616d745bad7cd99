//! Best-effort recursive directory walk.
//!
//! Unreadable subtrees, entries that vanish between listing and stat, and
//! broken symlinks are skipped and counted rather than failing the walk.

use crate::error::{Result, SyncError};
use crate::snapshot::{FileDescriptor, IgnoreMatcher, Snapshot};
use ignore::WalkBuilder;
use std::fs;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkStats {
    pub files: u64,
    pub dirs: u64,
    /// Entries dropped because they could not be listed or stat'ed
    pub skipped: u64,
}

/// Walk `root` and return every non-excluded entry below it.
///
/// Symlinks are resolved before deciding whether an entry is a directory, so
/// a linked directory is descended into. Link cycles are detected by the
/// walker and skipped. The root itself is not part of the snapshot.
///
/// Blocking; run it on a blocking thread. The only error is cancellation,
/// checked before every entry.
pub fn walk(
    root: &Path,
    matcher: Option<&IgnoreMatcher>,
    cancel: &CancellationToken,
) -> Result<(Snapshot, WalkStats)> {
    let mut builder = WalkBuilder::new(root);
    builder.standard_filters(false).follow_links(true);

    if let Some(matcher) = matcher {
        let matcher = matcher.clone();
        let root = root.to_path_buf();
        // Excluded directories are pruned here, so they are never descended into
        builder.filter_entry(move |entry| {
            if entry.depth() == 0 {
                return true;
            }
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            !matcher.matches(relative, is_dir)
        });
    }

    let mut snapshot = Snapshot::new();
    let mut stats = WalkStats::default();

    for result in builder.build() {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                debug!("Skipping unreadable entry: {}", err);
                stats.skipped += 1;
                continue;
            }
        };

        if entry.depth() == 0 {
            continue;
        }

        let metadata = match fs::metadata(entry.path()) {
            Ok(metadata) => metadata,
            Err(err) => {
                // Gone since it was listed
                debug!("Skipping {}: {}", entry.path().display(), err);
                stats.skipped += 1;
                continue;
            }
        };

        if metadata.is_dir() {
            stats.dirs += 1;
        } else {
            stats.files += 1;
        }
        snapshot.insert(FileDescriptor::from_metadata(
            entry.path().to_path_buf(),
            &metadata,
        ));
    }

    debug!(
        "Walked {}: {} files, {} dirs, {} skipped",
        root.display(),
        stats.files,
        stats.dirs,
        stats.skipped
    );

    Ok((snapshot, stats))
}
